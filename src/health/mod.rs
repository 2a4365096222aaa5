//! Worker health monitoring
//!
//! Decides at any instant whether a worker may receive new work. Cached
//! health is refreshed by a background probe loop and, when stale, by
//! short-deadline probes on the dispatch path. Transport failures reported
//! by the execution path flip a worker unhealthy immediately.

pub mod breaker;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Args;
use crate::workers::{Worker, WorkerRegistry};

/// How long a successful probe result stays fresh
const PROBE_FRESHNESS: Duration = Duration::from_secs(2);

/// Health monitor over the worker fleet
pub struct HealthMonitor {
    client: reqwest::Client,
    registry: Arc<WorkerRegistry>,
    probe_interval: Duration,
    dispatch_probe_timeout: Duration,
    bg_probe_timeout: Duration,
    /// Consecutive probe failures before the healthy flag drops
    failure_threshold: u32,
}

impl HealthMonitor {
    pub fn new(registry: Arc<WorkerRegistry>, args: &Args) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            probe_interval: Duration::from_secs(args.probe_interval_secs),
            dispatch_probe_timeout: Duration::from_secs(args.dispatch_probe_timeout_secs),
            bg_probe_timeout: Duration::from_secs(args.bg_probe_timeout_secs),
            failure_threshold: args.breaker_failure_threshold,
        }
    }

    /// Cached health state, no network call
    pub fn is_healthy(&self, worker: &Worker) -> bool {
        worker.is_healthy()
    }

    /// Flip a worker unhealthy now. Called by the execution path on
    /// transport errors and execution timeouts.
    pub fn mark_unhealthy(&self, worker: &Worker, reason: &str) {
        if worker.is_healthy() {
            warn!(worker = %worker.id, reason = reason, "Worker marked unhealthy");
        }
        worker.set_healthy(false);
    }

    /// Probe the worker's stats endpoint with the given deadline
    pub async fn probe(&self, worker: &Worker, timeout: Duration) -> bool {
        let url = format!("{}/system_stats", worker.base_url);
        let outcome = self.client.get(&url).timeout(timeout).send().await;
        worker.touch_probe();

        match outcome {
            Ok(resp) if resp.status().is_success() => {
                if !worker.is_healthy() {
                    info!(worker = %worker.id, "Worker recovered");
                }
                worker.set_healthy(true);
                true
            }
            Ok(resp) => {
                self.note_probe_failure(worker, &format!("status {}", resp.status()));
                false
            }
            Err(e) => {
                self.note_probe_failure(worker, &e.to_string());
                false
            }
        }
    }

    /// Real-time gate used by the scheduler just before dispatch: trust a
    /// fresh healthy verdict, otherwise probe with the short deadline.
    pub async fn before_dispatch(&self, worker: &Worker) -> bool {
        if worker.is_healthy() {
            if let Some(age) = worker.probe_age() {
                if age < PROBE_FRESHNESS {
                    return true;
                }
            }
        }
        self.probe(worker, self.dispatch_probe_timeout).await
    }

    fn note_probe_failure(&self, worker: &Worker, reason: &str) {
        let failures = worker.record_probe_failure();
        debug!(
            worker = %worker.id,
            failures = failures,
            reason = reason,
            "Probe failed"
        );
        if failures >= self.failure_threshold && worker.is_healthy() {
            warn!(
                worker = %worker.id,
                failures = failures,
                "Worker unhealthy after consecutive probe failures"
            );
            worker.set_healthy(false);
        }
    }
}

/// Start the background probe loop. Each tick probes every worker
/// concurrently; a slow worker cannot delay the others.
pub fn spawn_probe_task(monitor: Arc<HealthMonitor>) -> JoinHandle<()> {
    info!(
        interval_secs = monitor.probe_interval.as_secs(),
        workers = monitor.registry.len(),
        "Starting health probe loop"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(monitor.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let probes = monitor.registry.all().iter().map(|worker| {
                let monitor = Arc::clone(&monitor);
                let worker = Arc::clone(worker);
                async move {
                    monitor.probe(&worker, monitor.bg_probe_timeout).await;
                }
            });
            futures::future::join_all(probes).await;

            debug!(
                healthy = monitor.registry.healthy_count(),
                total = monitor.registry.len(),
                "Probe sweep complete"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_monitor(hosts: &[&str]) -> (Arc<WorkerRegistry>, HealthMonitor) {
        let registry = Arc::new(WorkerRegistry::from_hosts(hosts));
        let args = Args::parse_from(["comfy-gateway"]);
        let monitor = HealthMonitor::new(Arc::clone(&registry), &args);
        (registry, monitor)
    }

    #[test]
    fn test_mark_unhealthy_flips_flag() {
        let (registry, monitor) = test_monitor(&["w1:8188"]);
        let worker = registry.get("w1:8188").unwrap();

        assert!(monitor.is_healthy(&worker));
        monitor.mark_unhealthy(&worker, "connection refused");
        assert!(!monitor.is_healthy(&worker));
    }

    #[tokio::test]
    async fn test_before_dispatch_trusts_fresh_probe() {
        let (registry, monitor) = test_monitor(&["127.0.0.1:1"]);
        let worker = registry.get("127.0.0.1:1").unwrap();

        // A fresh healthy verdict short-circuits the network probe, so the
        // unroutable address is never contacted.
        worker.touch_probe();
        assert!(monitor.before_dispatch(&worker).await);
    }

    #[tokio::test]
    async fn test_probe_failure_drops_health_after_threshold() {
        let (registry, monitor) = test_monitor(&["127.0.0.1:1"]);
        let worker = registry.get("127.0.0.1:1").unwrap();

        // Nothing listens on port 1; three failed probes flip the flag
        for _ in 0..3 {
            assert!(!monitor.probe(&worker, Duration::from_millis(200)).await);
        }
        assert!(!worker.is_healthy());
    }
}
