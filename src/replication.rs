//! Replication pipeline: fans out mutations to follower nodes.
//!
//! Runs only on a primary with replication enabled. Async mode queues
//! ops on a bounded channel and dispatches from worker threads; sync
//! mode dispatches inline on the caller's thread. Either way, dispatch
//! to each healthy follower happens in parallel, one short-lived thread
//! per follower per op, joined before the dispatch is considered done.

use crate::config::{Config, ReplicationMode};
use crate::metrics::MetricsCollector;
use crate::protocol;
use crate::replica::ReplicaDirectory;
use crate::store::Shutdown;
use log::{debug, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// One mutation queued for replication, with its retry count.
#[derive(Debug, Clone)]
pub enum ReplicationOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    BatchPut { keys: Vec<Vec<u8>>, values: Vec<Vec<u8>> },
}

struct QueuedOp {
    op: ReplicationOp,
    retry_count: u32,
}

/// Owns the replica directory, the bounded queue, and the worker
/// threads (async mode) or does inline dispatch (sync mode).
pub struct ReplicationPipeline {
    config: Config,
    replicas: Arc<ReplicaDirectory>,
    sender: SyncSender<QueuedOp>,
    metrics: Arc<MetricsCollector>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

const WORKER_COUNT: usize = 2;

impl ReplicationPipeline {
    /// Starts the pipeline: in async mode, spawns `WORKER_COUNT` worker
    /// threads draining the bounded queue; in sync mode no workers are
    /// needed since `enqueue` dispatches inline.
    pub fn start(config: Config, shutdown: Arc<Shutdown>) -> ReplicationPipeline {
        let replicas = Arc::new(ReplicaDirectory::new(
            &config.replica_addresses,
            config.replication_max_failures,
        ));
        let metrics = MetricsCollector::global();
        let (sender, receiver) = sync_channel(config.replication_queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::new();
        if config.replication_mode == ReplicationMode::Async {
            for i in 0..WORKER_COUNT {
                workers.push(spawn_worker(
                    i,
                    Arc::clone(&receiver),
                    Arc::clone(&replicas),
                    Arc::clone(&metrics),
                    config.clone(),
                    Arc::clone(&shutdown),
                    sender.clone(),
                ));
            }
        }

        ReplicationPipeline {
            config,
            replicas,
            sender,
            metrics,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues `op` for replication. In async mode this never blocks:
    /// a full queue drops the op (and increments `replication_dropped`).
    /// In sync mode this dispatches to every healthy follower inline
    /// before returning.
    pub fn enqueue(&self, op: ReplicationOp) {
        self.metrics.increment("replication_total", 1);
        match self.config.replication_mode {
            ReplicationMode::Async => {
                match self.sender.try_send(QueuedOp { op, retry_count: 0 }) {
                    Ok(()) => {
                        self.metrics.set(
                            "replication_queue_depth",
                            self.metrics.get("replication_queue_depth") + 1,
                        );
                    }
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        self.metrics.increment("replication_dropped", 1);
                        warn!(
                            target: "kv_store::replica",
                            "replication queue full, dropping op"
                        );
                    }
                }
            }
            ReplicationMode::Sync => {
                dispatch_to_all(&op, &self.replicas, &self.metrics, self.config.replication_timeout);
            }
        }
    }

    pub fn healthy_followers(&self) -> Vec<SocketAddr> {
        self.replicas.healthy_addresses()
    }
}

impl Drop for ReplicationPipeline {
    fn drop(&mut self) {
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn spawn_worker(
    index: usize,
    receiver: Arc<Mutex<Receiver<QueuedOp>>>,
    replicas: Arc<ReplicaDirectory>,
    metrics: Arc<MetricsCollector>,
    config: Config,
    shutdown: Arc<Shutdown>,
    resender: SyncSender<QueuedOp>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("replication-worker-{}", index))
        .spawn(move || loop {
            if shutdown.is_set() {
                return;
            }
            let queued = {
                let rx = receiver.lock().unwrap();
                rx.recv_timeout(Duration::from_millis(200))
            };
            let queued = match queued {
                Ok(q) => q,
                Err(_) => continue,
            };
            metrics.set("replication_queue_depth", (metrics.get("replication_queue_depth") - 1).max(0));

            let successes = dispatch_to_all(&queued.op, &replicas, &metrics, config.replication_timeout);
            if successes == 0 && queued.retry_count < config.replication_max_retries {
                let retried = QueuedOp {
                    op: queued.op,
                    retry_count: queued.retry_count + 1,
                };
                if resender.try_send(retried).is_err() {
                    metrics.increment("replication_dropped", 1);
                }
            }
        })
        .expect("failed to spawn replication worker thread")
}

/// Dispatches `op` to every currently-healthy follower in parallel, one
/// short-lived thread per follower, joined before returning. Returns
/// the number of successful dispatches.
fn dispatch_to_all(
    op: &ReplicationOp,
    replicas: &Arc<ReplicaDirectory>,
    metrics: &Arc<MetricsCollector>,
    timeout: Duration,
) -> usize {
    let targets = replicas.healthy_addresses();
    if targets.is_empty() {
        return 0;
    }
    let command = encode_command(op);

    let handles: Vec<_> = targets
        .into_iter()
        .map(|addr| {
            let command = command.clone();
            let replicas = Arc::clone(replicas);
            let metrics = Arc::clone(metrics);
            std::thread::spawn(move || {
                let ok = dispatch_one(addr, &command, timeout);
                if ok {
                    replicas.record_success(&addr);
                    metrics.increment("replication_successful", 1);
                } else {
                    replicas.record_failure(&addr);
                    metrics.increment("replication_failed", 1);
                }
                ok
            })
        })
        .collect();

    handles
        .into_iter()
        .filter_map(|h| h.join().ok())
        .filter(|ok| *ok)
        .count()
}

fn dispatch_one(addr: SocketAddr, command: &[u8], timeout: Duration) -> bool {
    let stream = match TcpStream::connect_timeout(&addr, timeout) {
        Ok(s) => s,
        Err(e) => {
            debug!(target: "kv_store::replica", "connect to {} failed: {}", addr, e);
            return false;
        }
    };
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));
    let mut writer = stream.try_clone().expect("tcp stream clone");
    if writer.write_all(command).is_err() {
        return false;
    }
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(_) => line.trim_end().eq_ignore_ascii_case("OK"),
        Err(_) => false,
    }
}

/// Encodes one replication op as a `REPLICATE` wire command (§6).
fn encode_command(op: &ReplicationOp) -> Vec<u8> {
    let mut line = Vec::new();
    match op {
        ReplicationOp::Put { key, value } => {
            line.extend_from_slice(b"REPLICATE PUT ");
            line.extend_from_slice(key);
            line.push(b' ');
            line.extend_from_slice(&protocol::escape(value));
        }
        ReplicationOp::Delete { key } => {
            line.extend_from_slice(b"REPLICATE DELETE ");
            line.extend_from_slice(key);
        }
        ReplicationOp::BatchPut { keys, values } => {
            line.extend_from_slice(b"REPLICATE BATCHPUT ");
            line.extend_from_slice(&protocol::join_raw(keys));
            line.push(b' ');
            line.extend_from_slice(&protocol::join_batch(values));
        }
    }
    line.push(b'\n');
    line
}
