//! Background checkpointer thread.
//!
//! Periodically snapshots the index to disk and truncates the WAL, so
//! recovery on next open only has to replay the (usually small) tail of
//! mutations since the last checkpoint rather than the whole history.

use crate::store::{run_checkpoint, StoreInner};
use log::warn;
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) fn spawn(inner: Arc<StoreInner>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("checkpointer".to_string())
        .spawn(move || loop {
            if inner.shutdown.wait_timeout(inner.config.checkpoint_interval) {
                return;
            }
            if let Err(e) = run_checkpoint(&inner) {
                warn!(target: "kv_store::checkpoint", "checkpoint cycle failed: {}", e);
            }
        })
        .expect("failed to spawn checkpointer thread")
}
