//! Store coordinator: the single entry point tying together the data
//! file, index, WAL, locks, and (optionally) replication.
//!
//! Every public operation here implements one of the protocols from the
//! top-level design note — put, delete, read, and range each acquire
//! locks in a specific, load-bearing order. Don't reorder the lock
//! acquisitions inside these methods without re-reading why.

use crate::config::Config;
use crate::datafile::DataFile;
use crate::dirlock::{self, DirLock};
use crate::error::{KvError, KvResult};
use crate::index::Index;
use crate::lock::SharedExclusiveLock;
use crate::metrics::MetricsCollector;
use crate::replication::{ReplicationOp, ReplicationPipeline};
use crate::wal::{Wal, WalEntry, WalOp};
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DATA_FILE_NAME: &str = "data.db";
const WAL_FILE_NAME: &str = "wal.log";
const INDEX_FILE_NAME: &str = "index.db";

/// Bound on how long `close()` waits for each background thread to exit
/// before abandoning it, per the shutdown contract.
const THREAD_JOIN_TIMEOUT: Duration = Duration::from_millis(1500);
const THREAD_JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The data file and index together, the unit the shared-exclusive lock
/// protects. `data_file` is `None` once `Store::close` has taken and
/// dropped it.
pub(crate) struct StoreState {
    pub(crate) data_file: Option<DataFile>,
    pub(crate) index: Index,
}

impl StoreState {
    /// The live data file. Panics if called after `close()`, which is not
    /// a supported usage — no operation is defined on a closed store.
    pub(crate) fn data_file(&self) -> &DataFile {
        self.data_file.as_ref().expect("store operation attempted after close")
    }

    pub(crate) fn data_file_mut(&mut self) -> &mut DataFile {
        self.data_file.as_mut().expect("store operation attempted after close")
    }

    /// Swaps in a freshly-rewritten data file, returning the old one so
    /// the caller can drop it after any rename it depends on completes.
    pub(crate) fn replace_data_file(&mut self, new_file: DataFile) -> Option<DataFile> {
        self.data_file.replace(new_file)
    }
}

/// Cooperative shutdown signal shared by every background thread.
pub(crate) struct Shutdown {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl Shutdown {
    fn new() -> Self {
        Shutdown {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        *self.flag.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    /// Waits up to `timeout`, waking early if shutdown fires. Returns
    /// `true` if shutdown was signaled (caller should exit its loop).
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.flag.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.condvar.wait_timeout(guard, timeout).unwrap();
        *guard
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: Config,
    /// `None` once `Store::close` has taken and dropped it, releasing the
    /// directory for the next opener.
    dir_lock: Mutex<Option<DirLock>>,
    pub(crate) state: SharedExclusiveLock<StoreState>,
    /// `None` once `Store::close` has taken, flushed, and dropped it.
    pub(crate) wal: Mutex<Option<Wal>>,
    pub(crate) wal_path: PathBuf,
    pub(crate) index_path: PathBuf,
    pub(crate) replication: Option<Arc<ReplicationPipeline>>,
    pub(crate) shutdown: Arc<Shutdown>,
    pub(crate) metrics: Arc<MetricsCollector>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle on one open store. Cheap to clone (an `Arc` underneath);
/// clones share the same underlying files, locks, and background
/// threads.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (or creates) a store rooted at `config.data_dir`, replays
    /// any pending WAL entries, and starts its background threads.
    ///
    /// ## Error Conditions
    /// - `DirectoryInUse`: another live process already holds the data
    ///   directory.
    /// - `CorruptedLog`: the index snapshot or WAL is unreadable.
    pub fn open(config: Config) -> KvResult<Store> {
        let dir_lock = dirlock::acquire(&config.data_dir)?;

        let data_path = config.data_dir.join(DATA_FILE_NAME);
        let wal_path = config.data_dir.join(WAL_FILE_NAME);
        let index_path = config.data_dir.join(INDEX_FILE_NAME);

        let data_file = DataFile::open(&data_path)?;
        let index = Index::load(&index_path)?;
        let mut wal = Wal::open(&wal_path)?;

        let mut state = StoreState {
            data_file: Some(data_file),
            index,
        };
        let replayed = recover(&mut state, &mut wal)?;
        if replayed > 0 {
            state.index.save(&index_path)?;
            wal.truncate()?;
            info!(
                target: "kv_store::store",
                "recovered {} WAL entries on open",
                replayed
            );
        }

        let shutdown = Arc::new(Shutdown::new());
        let replication = if config.replication_enabled && !config.is_follower {
            Some(Arc::new(ReplicationPipeline::start(
                config.clone(),
                Arc::clone(&shutdown),
            )))
        } else {
            None
        };

        let inner = Arc::new(StoreInner {
            config,
            dir_lock: Mutex::new(Some(dir_lock)),
            state: SharedExclusiveLock::new(state),
            wal: Mutex::new(Some(wal)),
            wal_path,
            index_path,
            replication,
            shutdown,
            metrics: MetricsCollector::global(),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();
        threads.push(crate::checkpoint::spawn(Arc::clone(&inner)));
        if inner.config.compaction_enabled && !inner.config.is_follower {
            threads.push(crate::compactor::spawn(Arc::clone(&inner)));
        }
        threads.push(spawn_metrics_logger(Arc::clone(&inner)));
        *inner.threads.lock().unwrap() = threads;

        Ok(Store { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Writes `key` -> `value`.
    ///
    /// ## Effects
    /// WAL entry, data append, index update, replication enqueue (if a
    /// primary with replication enabled).
    pub fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.put_internal(key, value)?;
        if let Some(pipeline) = &self.inner.replication {
            pipeline.enqueue(ReplicationOp::Put {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        self.inner.metrics.increment("store_puts_total", 1);
        Ok(())
    }

    fn put_internal(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        {
            let mut wal = self.inner.wal.lock().unwrap();
            wal_mut(&mut wal).log(WalOp::Put, key, Some(value))?;
        }
        {
            let mut state = self.inner.state.write();
            let (offset, length) = state.data_file_mut().append(key, value)?;
            state.index.put(key.to_vec(), offset, length);
        }
        Ok(())
    }

    /// Writes every `(key, value)` pair as a single WAL burst followed
    /// by one exclusive-lock append+index run.
    ///
    /// ## Error Conditions
    /// - `BatchLengthMismatch`: `keys.len() != values.len()`.
    pub fn batch_put(&self, keys: &[Vec<u8>], values: &[Vec<u8>]) -> KvResult<()> {
        if keys.len() != values.len() {
            return Err(KvError::BatchLengthMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        {
            let mut wal = self.inner.wal.lock().unwrap();
            let wal = wal_mut(&mut wal);
            for (k, v) in keys.iter().zip(values.iter()) {
                wal.log(WalOp::Put, k, Some(v))?;
            }
        }
        {
            let mut state = self.inner.state.write();
            for (k, v) in keys.iter().zip(values.iter()) {
                let (offset, length) = state.data_file_mut().append(k, v)?;
                state.index.put(k.clone(), offset, length);
            }
        }
        if let Some(pipeline) = &self.inner.replication {
            pipeline.enqueue(ReplicationOp::BatchPut {
                keys: keys.to_vec(),
                values: values.to_vec(),
            });
        }
        self.inner
            .metrics
            .increment("store_puts_total", keys.len() as i64);
        Ok(())
    }

    /// Reads the value for `key`, if present.
    pub fn read(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let state = self.inner.state.read();
        let entry = match state.index.get(key) {
            Some(e) => e,
            None => return Ok(None),
        };
        let (stored_key, value) = state.data_file().read(entry.offset, entry.length)?;
        if stored_key != key {
            warn!(
                target: "kv_store::store",
                "index/data key mismatch at offset {} (should be unreachable)",
                entry.offset
            );
            return Ok(None);
        }
        self.inner.metrics.increment("store_reads_total", 1);
        Ok(Some(value))
    }

    /// Reads every key with `start <= key <= end`, byte-lexicographic,
    /// inclusive at both ends. Returned in key order.
    pub fn range(&self, start: &[u8], end: &[u8]) -> KvResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let state = self.inner.state.read();
        let slice = state.index.range(start, end);
        let mut out = BTreeMap::new();
        for (key, entry) in slice {
            let (stored_key, value) = state.data_file().read(entry.offset, entry.length)?;
            if stored_key != key {
                warn!(
                    target: "kv_store::store",
                    "index/data key mismatch at offset {} during range scan",
                    entry.offset
                );
                continue;
            }
            out.insert(key, value);
        }
        Ok(out)
    }

    /// Deletes `key`. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> KvResult<bool> {
        {
            let state = self.inner.state.read();
            if state.index.get(key).is_none() {
                return Ok(false);
            }
        }
        {
            let mut wal = self.inner.wal.lock().unwrap();
            wal_mut(&mut wal).log(WalOp::Delete, key, None)?;
        }
        let existed = {
            let mut state = self.inner.state.write();
            state.index.delete(key)
        };
        if existed {
            if let Some(pipeline) = &self.inner.replication {
                pipeline.enqueue(ReplicationOp::Delete {
                    key: key.to_vec(),
                });
            }
            self.inner.metrics.increment("store_deletes_total", 1);
        }
        Ok(existed)
    }

    /// Applies a replicated operation locally without re-enqueuing
    /// replication. Used by the server when handling a `REPLICATE`
    /// command on a follower node.
    ///
    /// ## Error Conditions
    /// - `NotAFollower`: this node is not configured as a follower.
    pub fn apply_replicated(&self, op: ReplicationOp) -> KvResult<()> {
        if !self.inner.config.is_follower {
            return Err(KvError::NotAFollower);
        }
        match op {
            ReplicationOp::Put { key, value } => self.put_internal(&key, &value),
            ReplicationOp::Delete { key } => {
                let mut wal = self.inner.wal.lock().unwrap();
                wal_mut(&mut wal).log(WalOp::Delete, &key, None)?;
                drop(wal);
                let mut state = self.inner.state.write();
                state.index.delete(&key);
                Ok(())
            }
            ReplicationOp::BatchPut { keys, values } => self.batch_put_local(&keys, &values),
        }
    }

    fn batch_put_local(&self, keys: &[Vec<u8>], values: &[Vec<u8>]) -> KvResult<()> {
        {
            let mut wal = self.inner.wal.lock().unwrap();
            let wal = wal_mut(&mut wal);
            for (k, v) in keys.iter().zip(values.iter()) {
                wal.log(WalOp::Put, k, Some(v))?;
            }
        }
        let mut state = self.inner.state.write();
        for (k, v) in keys.iter().zip(values.iter()) {
            let (offset, length) = state.data_file_mut().append(k, v)?;
            state.index.put(k.clone(), offset, length);
        }
        Ok(())
    }

    /// A sorted snapshot of every metrics counter, for the `STATS` wire
    /// command and tests.
    pub fn metrics_snapshot(&self) -> Vec<(String, i64)> {
        self.inner.metrics.snapshot()
    }

    /// Idempotent shutdown: signals background threads, joins each with a
    /// bounded timeout (abandoning any that don't exit in time), runs a
    /// final checkpoint, then explicitly closes the WAL, drops the data
    /// file, and releases the directory lock — all synchronously, rather
    /// than waiting on the last `Arc<StoreInner>` clone (e.g. a
    /// connection-handler thread in `server.rs`) to drop.
    pub fn close(&self) {
        self.inner.shutdown.signal();

        let handles: Vec<JoinHandle<()>> = self.inner.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            join_with_timeout(handle, THREAD_JOIN_TIMEOUT);
        }

        if let Err(e) = self.checkpoint_now() {
            warn!(target: "kv_store::store", "final checkpoint during close failed: {}", e);
        }

        let wal = self.inner.wal.lock().unwrap().take();
        if let Some(wal) = wal {
            if let Err(e) = wal.close() {
                warn!(target: "kv_store::store", "closing WAL during shutdown failed: {}", e);
            }
        }

        {
            let mut state = self.inner.state.write();
            drop(state.data_file.take());
        }

        let dir_lock = self.inner.dir_lock.lock().unwrap().take();
        drop(dir_lock);
    }

    /// Runs one checkpoint cycle synchronously: snapshot the index,
    /// truncate the WAL. Called by the checkpointer thread and once
    /// more during `close`.
    pub(crate) fn checkpoint_now(&self) -> KvResult<usize> {
        run_checkpoint(&self.inner)
    }

    pub(crate) fn inner(&self) -> &Arc<StoreInner> {
        &self.inner
    }
}

/// Snapshots the index to disk and truncates the WAL. The order
/// (snapshot, then truncate) is load-bearing: a crash between the two
/// steps is recovered correctly by WAL replay on next open, which would
/// simply re-apply entries already reflected in the snapshot.
pub(crate) fn run_checkpoint(inner: &StoreInner) -> KvResult<usize> {
    let start = Instant::now();
    let count = {
        let state = inner.state.write();
        state.index.save(&inner.index_path)?;
        state.index.len()
    };
    {
        let mut wal = inner.wal.lock().unwrap();
        if let Some(wal) = wal.as_mut() {
            wal.truncate()?;
        }
    }
    inner
        .metrics
        .set("checkpoint_duration_ms", start.elapsed().as_millis() as i64);
    inner.metrics.increment("checkpoints_total", 1);
    info!(
        target: "kv_store::checkpoint",
        "checkpointed {} entries in {:?}",
        count,
        start.elapsed()
    );
    Ok(count)
}

/// Replays the WAL into `state`, applying each entry in order. Returns
/// the number of entries replayed. Idempotent: replaying twice leaves
/// the same final index, since each entry overwrites prior state for
/// its key.
fn recover(state: &mut StoreState, wal: &mut Wal) -> KvResult<usize> {
    let entries = wal.replay()?;
    for entry in &entries {
        apply_entry(state, entry)?;
    }
    Ok(entries.len())
}

fn apply_entry(state: &mut StoreState, entry: &WalEntry) -> KvResult<()> {
    match entry.op {
        WalOp::Put => {
            let value = entry.value.as_deref().unwrap_or(&[]);
            let (offset, length) = state.data_file_mut().append(&entry.key, value)?;
            state.index.put(entry.key.clone(), offset, length);
        }
        WalOp::Delete => {
            state.index.delete(&entry.key);
        }
    }
    Ok(())
}

/// Unwraps the live WAL behind its mutex. Panics if called after
/// `close()` has taken it — not a supported usage.
fn wal_mut(wal: &mut Option<Wal>) -> &mut Wal {
    wal.as_mut().expect("store operation attempted after close")
}

/// Joins `handle`, polling rather than blocking so a stalled thread can't
/// hang `close()` forever. A thread that hasn't exited by `timeout` is
/// abandoned: the `JoinHandle` is simply dropped, which detaches it
/// without blocking.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                target: "kv_store::store",
                "background thread did not exit within the shutdown timeout; abandoning it"
            );
            return;
        }
        std::thread::sleep(THREAD_JOIN_POLL_INTERVAL);
    }
}

fn spawn_metrics_logger(inner: Arc<StoreInner>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("metrics-logger".to_string())
        .spawn(move || loop {
            if inner.shutdown.wait_timeout(inner.config.metrics_log_interval) {
                return;
            }
            let snapshot = inner.metrics.snapshot();
            info!(target: "kv_store::metrics", "{:?}", snapshot);
        })
        .expect("failed to spawn metrics-logger thread")
}

pub(crate) fn data_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DATA_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Store {
        Store::open(Config::new(dir)).unwrap()
    }

    #[test]
    fn put_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(b"k1", b"v1").unwrap();
        assert_eq!(store.read(b"k1").unwrap(), Some(b"v1".to_vec()));
        store.close();
    }

    #[test]
    fn delete_removes_key_and_reports_prior_presence() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(b"k1", b"v1").unwrap();
        assert!(store.delete(b"k1").unwrap());
        assert!(!store.delete(b"k1").unwrap());
        assert_eq!(store.read(b"k1").unwrap(), None);
        store.close();
    }

    #[test]
    fn batch_put_then_range() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let keys = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let values = vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()];
        store.batch_put(&keys, &values).unwrap();

        let range = store.range(b"a", b"b").unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range.get(b"a".as_slice()), Some(&b"1".to_vec()));
        store.close();
    }

    #[test]
    fn batch_put_rejects_length_mismatch() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let err = store
            .batch_put(&[b"a".to_vec()], &[b"1".to_vec(), b"2".to_vec()])
            .unwrap_err();
        assert!(matches!(err, KvError::BatchLengthMismatch { .. }));
        store.close();
    }

    #[test]
    fn reopen_recovers_uncheckpointed_writes() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.put(b"k1", b"v1").unwrap();
            store.close();
        }
        let store = open(dir.path());
        assert_eq!(store.read(b"k1").unwrap(), Some(b"v1".to_vec()));
        store.close();
    }

    #[test]
    fn checkpoint_now_truncates_wal_and_persists_index() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(b"k1", b"v1").unwrap();
        store.checkpoint_now().unwrap();
        assert!(dir.path().join(INDEX_FILE_NAME).exists());
        store.close();
    }
}
