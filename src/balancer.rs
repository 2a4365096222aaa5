//! Least-loaded worker selection
//!
//! The balancer filters the fleet down to dispatchable workers (healthy,
//! below the per-worker job cap, breaker not open), orders them by load
//! with stable id tie-breaks, and gates the final choice with a real-time
//! probe so a dead worker discovered at dispatch time is skipped instead of
//! receiving the job.

use std::sync::Arc;

use tracing::debug;

use crate::health::{BreakerRegistry, HealthMonitor};
use crate::metrics::MetricsAggregator;
use crate::workers::{Worker, WorkerRegistry};

pub struct LoadBalancer {
    registry: Arc<WorkerRegistry>,
    health: Arc<HealthMonitor>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<MetricsAggregator>,
    max_jobs_per_worker: usize,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        health: Arc<HealthMonitor>,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<MetricsAggregator>,
        max_jobs_per_worker: usize,
    ) -> Self {
        Self {
            registry,
            health,
            breakers,
            metrics,
            max_jobs_per_worker,
        }
    }

    /// Dispatchable candidates ordered by ascending load, id as tie-break.
    /// The registry is already id-sorted, so a stable sort on load alone
    /// preserves id order between equals.
    fn candidates(&self) -> Vec<Arc<Worker>> {
        let mut candidates: Vec<Arc<Worker>> = self
            .registry
            .all()
            .iter()
            .filter(|w| self.health.is_healthy(w))
            .filter(|w| w.active_jobs() < self.max_jobs_per_worker)
            .filter(|w| {
                self.breakers
                    .breaker(&BreakerRegistry::submit_name(&w.id))
                    .would_allow()
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|w| w.active_jobs());
        candidates
    }

    /// Pick the best dispatchable worker, or None if every candidate fails
    /// the real-time gate.
    pub async fn select(&self) -> Option<Arc<Worker>> {
        for worker in self.candidates() {
            if self.health.before_dispatch(&worker).await {
                debug!(
                    worker = %worker.id,
                    active_jobs = worker.active_jobs(),
                    "Worker selected for dispatch"
                );
                return Some(worker);
            }
            // before_dispatch already recorded the failed probe; try the
            // next candidate this tick.
            self.metrics.record_dispatch_failure(&worker.id);
            debug!(worker = %worker.id, "Worker failed dispatch gate, trying next");
        }
        None
    }

    /// Atomically claim a slot on the worker. Called under dispatch.
    pub fn increment(&self, worker: &Worker) -> usize {
        worker.increment_jobs()
    }

    /// Release a slot. Always called when a job task finishes.
    pub fn decrement(&self, worker: &Worker) -> usize {
        worker.decrement_jobs()
    }

    /// Whether any worker could currently accept work
    pub fn has_dispatchable(&self) -> bool {
        !self.candidates().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use crate::health::BreakerConfig;
    use clap::Parser;

    fn test_balancer(hosts: &[&str]) -> (Arc<WorkerRegistry>, LoadBalancer) {
        let registry = Arc::new(WorkerRegistry::from_hosts(hosts));
        let args = Args::parse_from(["comfy-gateway"]);
        let health = Arc::new(HealthMonitor::new(Arc::clone(&registry), &args));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let balancer = LoadBalancer::new(
            Arc::clone(&registry),
            health,
            breakers,
            Arc::new(MetricsAggregator::new()),
            args.max_jobs_per_worker,
        );
        (registry, balancer)
    }

    #[test]
    fn test_least_loaded_wins() {
        let (registry, balancer) = test_balancer(&["a:8188", "b:8188"]);
        let a = registry.get("a:8188").unwrap();

        a.increment_jobs();
        let candidates = balancer.candidates();
        assert_eq!(candidates[0].id, "b:8188");
    }

    #[test]
    fn test_id_breaks_ties() {
        let (_registry, balancer) = test_balancer(&["b:8188", "a:8188"]);
        let candidates = balancer.candidates();
        assert_eq!(candidates[0].id, "a:8188");
        assert_eq!(candidates[1].id, "b:8188");
    }

    #[test]
    fn test_capped_workers_excluded() {
        let (registry, balancer) = test_balancer(&["a:8188", "b:8188"]);
        let a = registry.get("a:8188").unwrap();

        a.increment_jobs();
        a.increment_jobs(); // at max_jobs_per_worker = 2

        let candidates = balancer.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "b:8188");
    }

    #[test]
    fn test_unhealthy_workers_excluded() {
        let (registry, balancer) = test_balancer(&["a:8188", "b:8188"]);
        registry.get("a:8188").unwrap().set_healthy(false);

        let candidates = balancer.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "b:8188");
    }

    #[test]
    fn test_open_breaker_excludes_worker() {
        let (registry, balancer) = test_balancer(&["a:8188", "b:8188"]);
        let _ = registry;
        balancer
            .breakers
            .breaker(&BreakerRegistry::submit_name("a:8188"))
            .force_open();

        let candidates = balancer.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "b:8188");
    }

    #[tokio::test]
    async fn test_round_robin_assignment_under_caps() {
        let (registry, balancer) = test_balancer(&["10.0.0.1:8188", "10.0.0.2:8188"]);
        // Fresh probes let select() skip the network gate
        for worker in registry.all() {
            worker.touch_probe();
        }

        // Four dispatches land alternately until both workers hit the cap
        let mut assignments = Vec::new();
        for _ in 0..4 {
            let worker = balancer.select().await.unwrap();
            balancer.increment(&worker);
            assignments.push(worker.id.clone());
        }

        assert_eq!(
            assignments,
            vec!["10.0.0.1:8188", "10.0.0.2:8188", "10.0.0.1:8188", "10.0.0.2:8188"]
        );
        assert_eq!(registry.get("10.0.0.1:8188").unwrap().active_jobs(), 2);
        assert_eq!(registry.get("10.0.0.2:8188").unwrap().active_jobs(), 2);

        // Both at cap: nothing left to dispatch
        assert!(balancer.select().await.is_none());
    }

    #[test]
    fn test_no_candidates_when_all_capped() {
        let (registry, balancer) = test_balancer(&["a:8188"]);
        let a = registry.get("a:8188").unwrap();
        a.increment_jobs();
        a.increment_jobs();

        assert!(!balancer.has_dispatchable());
    }
}
