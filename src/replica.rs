//! Replica directory: tracks follower endpoints and their health.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::SystemTime;

/// Health and bookkeeping state for one follower endpoint.
#[derive(Debug, Clone)]
pub struct ReplicaHealth {
    pub is_healthy: bool,
    pub last_success: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
    pub consecutive_failures: u32,
}

impl Default for ReplicaHealth {
    fn default() -> Self {
        ReplicaHealth {
            is_healthy: true,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
        }
    }
}

/// Thread-safe registry of follower endpoints, keyed by `(host, port)`.
pub struct ReplicaDirectory {
    max_failures: u32,
    replicas: Mutex<HashMap<SocketAddr, ReplicaHealth>>,
}

impl ReplicaDirectory {
    pub fn new(addresses: &[SocketAddr], max_failures: u32) -> Self {
        let mut replicas = HashMap::new();
        for addr in addresses {
            replicas.insert(*addr, ReplicaHealth::default());
        }
        ReplicaDirectory {
            max_failures,
            replicas: Mutex::new(replicas),
        }
    }

    pub fn add(&self, addr: SocketAddr) {
        self.replicas
            .lock()
            .unwrap()
            .entry(addr)
            .or_insert_with(ReplicaHealth::default);
    }

    pub fn remove(&self, addr: &SocketAddr) {
        self.replicas.lock().unwrap().remove(addr);
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<ReplicaHealth> {
        self.replicas.lock().unwrap().get(addr).cloned()
    }

    /// Addresses currently considered healthy, the fan-out set for a
    /// replication dispatch.
    pub fn healthy_addresses(&self) -> Vec<SocketAddr> {
        self.replicas
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, h)| h.is_healthy)
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub fn all_addresses(&self) -> Vec<SocketAddr> {
        self.replicas.lock().unwrap().keys().copied().collect()
    }

    /// Records a successful dispatch: resets the failure streak and
    /// marks the endpoint healthy, logging if health was just regained.
    pub fn record_success(&self, addr: &SocketAddr) {
        let mut replicas = self.replicas.lock().unwrap();
        let health = replicas.entry(*addr).or_insert_with(ReplicaHealth::default);
        let regained = !health.is_healthy;
        health.is_healthy = true;
        health.consecutive_failures = 0;
        health.last_success = Some(SystemTime::now());
        if regained {
            log::info!(target: "kv_store::replica", "follower {} regained health", addr);
        }
    }

    /// Records a failed dispatch, flipping the endpoint unhealthy once
    /// `max_failures` consecutive failures have accumulated.
    pub fn record_failure(&self, addr: &SocketAddr) {
        let mut replicas = self.replicas.lock().unwrap();
        let health = replicas.entry(*addr).or_insert_with(ReplicaHealth::default);
        health.consecutive_failures += 1;
        health.last_failure = Some(SystemTime::now());
        if health.consecutive_failures >= self.max_failures && health.is_healthy {
            health.is_healthy = false;
            log::warn!(
                target: "kv_store::replica",
                "follower {} marked unhealthy after {} consecutive failures",
                addr,
                health.consecutive_failures
            );
        }
    }
}
