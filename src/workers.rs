//! Worker fleet model
//!
//! A worker is one instance of the upstream image-processing service. The
//! registry is built once at startup from configuration; per-worker mutable
//! state (health flag, active job counter, probe bookkeeping) is atomic so
//! the scheduler, balancer and health monitor can share it freely.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::Args;

/// A single upstream worker
pub struct Worker {
    /// Stable identity, the configured host:port
    pub id: String,
    /// Base URL for REST endpoints (prompt/history/view/system_stats)
    pub base_url: String,
    /// Base URL for the streaming endpoint (clientId appended per stream)
    pub ws_url: String,
    active_jobs: AtomicUsize,
    healthy: AtomicBool,
    consecutive_probe_failures: AtomicU32,
    last_probe: Mutex<Option<Instant>>,
}

impl Worker {
    pub fn new(host: &str, http_scheme: &str, ws_scheme: &str) -> Self {
        Self {
            id: host.to_string(),
            base_url: format!("{http_scheme}://{host}"),
            ws_url: format!("{ws_scheme}://{host}/ws"),
            active_jobs: AtomicUsize::new(0),
            // Workers start healthy; the first probe corrects this quickly
            healthy: AtomicBool::new(true),
            consecutive_probe_failures: AtomicU32::new(0),
            last_probe: Mutex::new(None),
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub fn increment_jobs(&self) -> usize {
        self.active_jobs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement_jobs(&self) -> usize {
        let mut current = self.active_jobs.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match self.active_jobs.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
        if healthy {
            self.consecutive_probe_failures.store(0, Ordering::SeqCst);
        }
    }

    pub fn record_probe_failure(&self) -> u32 {
        self.consecutive_probe_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn probe_failures(&self) -> u32 {
        self.consecutive_probe_failures.load(Ordering::SeqCst)
    }

    /// Stamp the probe clock
    pub fn touch_probe(&self) {
        let mut guard = self.lock_probe();
        *guard = Some(Instant::now());
    }

    /// Age of the most recent probe, if any
    pub fn probe_age(&self) -> Option<std::time::Duration> {
        self.lock_probe().map(|t| t.elapsed())
    }

    fn lock_probe(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_probe
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Immutable, id-sorted worker fleet
pub struct WorkerRegistry {
    workers: Vec<Arc<Worker>>,
}

impl WorkerRegistry {
    pub fn from_args(args: &Args) -> Self {
        let mut hosts = args.worker_host_list();
        hosts.sort();
        hosts.dedup();

        let workers = hosts
            .iter()
            .map(|h| Arc::new(Worker::new(h, args.http_scheme(), args.ws_scheme())))
            .collect();
        Self { workers }
    }

    #[cfg(test)]
    pub fn from_hosts(hosts: &[&str]) -> Self {
        let mut hosts: Vec<&str> = hosts.to_vec();
        hosts.sort();
        let workers = hosts
            .iter()
            .map(|h| Arc::new(Worker::new(h, "http", "ws")))
            .collect();
        Self { workers }
    }

    pub fn all(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.iter().find(|w| w.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_healthy()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_urls() {
        let worker = Worker::new("10.0.0.1:8188", "http", "ws");
        assert_eq!(worker.id, "10.0.0.1:8188");
        assert_eq!(worker.base_url, "http://10.0.0.1:8188");
        assert_eq!(worker.ws_url, "ws://10.0.0.1:8188/ws");
    }

    #[test]
    fn test_job_counter_never_negative() {
        let worker = Worker::new("w1", "http", "ws");
        assert_eq!(worker.decrement_jobs(), 0);
        assert_eq!(worker.increment_jobs(), 1);
        assert_eq!(worker.increment_jobs(), 2);
        assert_eq!(worker.decrement_jobs(), 1);
        assert_eq!(worker.decrement_jobs(), 0);
        assert_eq!(worker.decrement_jobs(), 0);
    }

    #[test]
    fn test_registry_sorted_and_deduped() {
        let registry = WorkerRegistry::from_hosts(&["b:8188", "a:8188"]);
        let ids: Vec<&str> = registry.all().iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["a:8188", "b:8188"]);
        assert!(registry.get("a:8188").is_some());
        assert!(registry.get("c:8188").is_none());
    }

    #[test]
    fn test_healthy_flag_resets_probe_failures() {
        let worker = Worker::new("w1", "http", "ws");
        worker.record_probe_failure();
        worker.record_probe_failure();
        assert_eq!(worker.probe_failures(), 2);
        worker.set_healthy(true);
        assert_eq!(worker.probe_failures(), 0);
    }
}
