//! Lightweight operational counters, following the reference codebase's
//! metrics module: a process-wide singleton behind a lock, rather than a
//! full metrics-exporter dependency this store has no use for.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

static GLOBAL: Lazy<Arc<MetricsCollector>> = Lazy::new(|| Arc::new(MetricsCollector::default()));

/// Process-wide counter registry.
#[derive(Default)]
pub struct MetricsCollector {
    counters: RwLock<HashMap<&'static str, AtomicI64>>,
}

impl MetricsCollector {
    /// Returns the process-wide singleton instance.
    pub fn global() -> Arc<MetricsCollector> {
        Arc::clone(&GLOBAL)
    }

    /// Increments the named counter by `delta`, creating it at zero if
    /// this is the first observation.
    pub fn increment(&self, name: &'static str, delta: i64) {
        if let Some(counter) = self.counters.read().unwrap().get(name) {
            counter.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Sets the named counter (used for gauges like queue depth).
    pub fn set(&self, name: &'static str, value: i64) {
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> i64 {
        self.counters
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// A sorted snapshot of every counter observed so far, for the
    /// periodic log line and the `STATS` wire command.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let counters = self.counters.read().unwrap();
        let mut out: Vec<(String, i64)> = counters
            .iter()
            .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.counters.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_is_shared() {
        let a = MetricsCollector::global();
        let b = MetricsCollector::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn increment_and_get() {
        let c = MetricsCollector::global();
        c.clear();
        c.increment("store_puts_total", 1);
        c.increment("store_puts_total", 2);
        assert_eq!(c.get("store_puts_total"), 3);
    }

    #[test]
    fn snapshot_is_sorted() {
        let c = MetricsCollector::global();
        c.clear();
        c.increment("zeta", 1);
        c.increment("alpha", 1);
        let snap = c.snapshot();
        assert_eq!(snap[0].0, "alpha");
        assert_eq!(snap.last().unwrap().0, "zeta");
    }
}
