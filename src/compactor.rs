//! Background compactor thread.
//!
//! Rewrites the data file to drop dead (overwritten or deleted) bytes
//! once the live-data ratio falls below `compaction_threshold`. Runs on
//! a dedicated thread, never concurrently with itself, and is skipped
//! entirely on followers and when `compaction_enabled = false`.

use crate::datafile::DataFile;
use crate::index::IndexEntry;
use crate::store::StoreInner;
use log::{info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

const COMPACT_FILE_NAME: &str = "data.db.compact";
const OLD_FILE_NAME: &str = "data.db.old";

pub(crate) fn spawn(inner: Arc<StoreInner>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("compactor".to_string())
        .spawn(move || loop {
            if inner.shutdown.wait_timeout(inner.config.compaction_interval) {
                return;
            }
            if let Err(e) = run_compaction_cycle(&inner) {
                warn!(target: "kv_store::compactor", "compaction cycle failed: {}", e);
            }
        })
        .expect("failed to spawn compactor thread")
}

/// Deletes the temp compaction file on drop unless explicitly
/// committed, so a failure mid-rewrite doesn't leave it behind.
struct TempFileGuard {
    path: PathBuf,
    committed: bool,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Runs one compaction cycle. Returns `Ok(None)` if the should-compact
/// check determined compaction was unnecessary.
pub(crate) fn run_compaction_cycle(inner: &StoreInner) -> crate::error::KvResult<Option<CompactionStats>> {
    let start = Instant::now();

    // 1. Should-compact check, under the shared lock.
    let snapshot: BTreeMap<Vec<u8>, IndexEntry>;
    let bytes_before;
    {
        let state = inner.state.read();
        bytes_before = state.data_file().size();
        if bytes_before < inner.config.compaction_min_file_size {
            return Ok(None);
        }
        let live_bytes = state.index.total_live_bytes();
        let dead_ratio = 1.0 - (live_bytes as f64 / bytes_before as f64);
        if dead_ratio < inner.config.compaction_threshold {
            return Ok(None);
        }
        // 2. Snapshot phase: clone the index while still holding the shared lock.
        snapshot = state.index.iter().map(|(k, v)| (k.clone(), *v)).collect();
    }

    // 3. Rewrite phase: append every snapshotted key's current bytes
    // into a private temp file. No lock needed for the temp file itself;
    // reads from the live data file take the shared lock per key.
    let compact_path = inner.config.data_dir.join(COMPACT_FILE_NAME);
    let mut guard = TempFileGuard {
        path: compact_path.clone(),
        committed: false,
    };
    let mut temp_file = DataFile::open(&compact_path)?;
    let mut rewritten: BTreeMap<Vec<u8>, IndexEntry> = BTreeMap::new();
    for (key, entry) in &snapshot {
        let (stored_key, value) = {
            let state = inner.state.read();
            state.data_file().read(entry.offset, entry.length)?
        };
        if &stored_key != key {
            warn!(
                target: "kv_store::compactor",
                "skipping key with index/data mismatch during rewrite"
            );
            continue;
        }
        let (offset, length) = temp_file.append(key, &value)?;
        rewritten.insert(key.clone(), IndexEntry { offset, length });
    }

    // 4. Reconcile & swap phase, under the exclusive lock.
    let (keys_rewritten, bytes_after);
    {
        let mut state = inner.state.write();
        let mut final_index: BTreeMap<Vec<u8>, IndexEntry> = BTreeMap::new();
        let current: Vec<(Vec<u8>, IndexEntry)> =
            state.index.iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (key, current_entry) in current {
            let snapshot_matches = snapshot.get(&key) == Some(&current_entry);
            let entry = if snapshot_matches {
                match rewritten.get(&key) {
                    Some(e) => *e,
                    None => continue, // mismatched key skipped during rewrite above
                }
            } else {
                // New or updated since the snapshot was taken; read the
                // current value and append it too.
                let (stored_key, value) = state.data_file().read(current_entry.offset, current_entry.length)?;
                if stored_key != key {
                    warn!(
                        target: "kv_store::compactor",
                        "skipping key with index/data mismatch during reconcile"
                    );
                    continue;
                }
                let (offset, length) = temp_file.append(&key, &value)?;
                IndexEntry { offset, length }
            };
            final_index.insert(key, entry);
        }

        let data_path = crate::store::data_file_path(&inner.config.data_dir);
        let old_path = inner.config.data_dir.join(OLD_FILE_NAME);

        // Renaming an open file is safe on the platforms this store
        // targets; the stale handle is dropped right after.
        std::fs::rename(&data_path, &old_path)?;
        std::fs::rename(&compact_path, &data_path)?;
        guard.committed = true;

        let new_data_file = DataFile::open(&data_path)?;
        let old_data_file = state.replace_data_file(new_data_file);
        drop(old_data_file);

        keys_rewritten = final_index.len();
        bytes_after = state.data_file().size();
        state.index.replace(final_index);
        state.index.save(&inner.index_path)?;
    }
    drop(guard);

    let stats = CompactionStats {
        bytes_before,
        bytes_after,
        keys_rewritten,
    };
    inner.metrics.increment("compactions_total", 1);
    inner
        .metrics
        .increment("compaction_bytes_reclaimed", (bytes_before.saturating_sub(bytes_after)) as i64);
    inner
        .metrics
        .set("compaction_duration_ms", start.elapsed().as_millis() as i64);
    info!(
        target: "kv_store::compactor",
        "compacted {} -> {} bytes, {} keys rewritten, in {:?}",
        stats.bytes_before,
        stats.bytes_after,
        stats.keys_rewritten,
        start.elapsed()
    );
    Ok(Some(stats))
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CompactionStats {
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub keys_rewritten: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Store;
    use tempfile::tempdir;

    #[test]
    fn skips_when_below_min_file_size() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path());
        config.compaction_min_file_size = 1024 * 1024;
        let store = Store::open(config).unwrap();
        store.put(b"k", b"v").unwrap();
        let result = run_compaction_cycle(store.inner()).unwrap();
        assert!(result.is_none());
        store.close();
    }

    #[test]
    fn reclaims_space_after_overwrites() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path());
        config.compaction_min_file_size = 1;
        config.compaction_threshold = 0.1;
        let store = Store::open(config).unwrap();

        for i in 0..50 {
            store.put(b"k", format!("value-{}", i).as_bytes()).unwrap();
        }
        store.put(b"k2", b"stays").unwrap();

        let before = store.inner().state.read().data_file().size();
        let stats = run_compaction_cycle(store.inner()).unwrap().expect("should compact");
        assert!(stats.bytes_after < before);
        assert_eq!(store.read(b"k").unwrap(), Some(b"value-49".to_vec()));
        assert_eq!(store.read(b"k2").unwrap(), Some(b"stays".to_vec()));
        store.close();
    }
}
