//! End-to-end replication: a primary propagating puts and deletes to two
//! follower servers over the real wire protocol.

use kv_store::config::Config;
use kv_store::server::Server;
use kv_store::store::Store;
use serial_test::serial;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

struct FollowerNode {
    store: Store,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl FollowerNode {
    fn start(port: u16) -> (FollowerNode, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path());
        config.is_follower = true;
        let store = Store::open(config).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let server_store = store.clone();
        let server_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            let server = Server::new(server_store, "127.0.0.1", port);
            server.run(server_shutdown).unwrap();
        });
        std::thread::sleep(Duration::from_millis(100));
        (
            FollowerNode {
                store,
                shutdown,
                handle: Some(handle),
            },
            dir,
        )
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        self.store.close();
    }
}

fn wait_for<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
#[serial]
fn puts_and_deletes_propagate_to_followers_within_two_seconds() {
    let (follower_a, _dir_a) = FollowerNode::start(19101);
    let (follower_b, _dir_b) = FollowerNode::start(19102);

    let primary_dir = tempdir().unwrap();
    let mut primary_config = Config::new(primary_dir.path());
    primary_config.replication_enabled = true;
    primary_config.replica_addresses = vec![
        "127.0.0.1:19101".parse().unwrap(),
        "127.0.0.1:19102".parse().unwrap(),
    ];
    let primary = Store::open(primary_config).unwrap();

    primary.put(b"replicated-key", b"replicated-value").unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || {
            follower_a.store.read(b"replicated-key").unwrap() == Some(b"replicated-value".to_vec())
                && follower_b.store.read(b"replicated-key").unwrap()
                    == Some(b"replicated-value".to_vec())
        }),
        "put did not propagate to both followers in time"
    );

    primary.delete(b"replicated-key").unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || {
            follower_a.store.read(b"replicated-key").unwrap() == None
                && follower_b.store.read(b"replicated-key").unwrap() == None
        }),
        "delete did not propagate to both followers in time"
    );

    primary.close();
    follower_a.stop();
    follower_b.stop();
}

#[test]
#[serial]
fn replicate_command_is_rejected_on_a_non_follower() {
    let (follower, _dir) = FollowerNode::start(19103);

    // Point a second "primary" directly at the follower's port to exercise
    // rejection from a peer that isn't itself a follower.
    let dir = tempdir().unwrap();
    let config = Config::new(dir.path());
    let non_follower = Store::open(config).unwrap();

    use kv_store::replication::ReplicationOp;
    let err = non_follower
        .apply_replicated(ReplicationOp::Put {
            key: b"x".to_vec(),
            value: b"y".to_vec(),
        })
        .unwrap_err();
    assert!(matches!(err, kv_store::KvError::NotAFollower));

    non_follower.close();
    follower.stop();
}
