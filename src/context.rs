//! Top-level system context
//!
//! All components of the job pipeline are constructed once at startup and
//! owned by a single [`SystemContext`] that request handlers, the
//! scheduler and the execution protocol share. No global singletons.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::balancer::LoadBalancer;
use crate::config::Args;
use crate::health::{BreakerConfig, BreakerRegistry, HealthMonitor};
use crate::jobs::JobRegistry;
use crate::metrics::MetricsAggregator;
use crate::upstream::{ComfyClient, StreamPoolConfig, StreamPools};
use crate::workers::WorkerRegistry;

/// Shared scheduler bookkeeping: the running/shutdown flags and the set of
/// in-flight job ids. Mutations are short non-suspending critical sections.
pub struct SchedulerState {
    running: AtomicBool,
    shutdown: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    pub fn add_in_flight(&self, job_id: &str) -> bool {
        self.lock().insert(job_id.to_string())
    }

    pub fn remove_in_flight(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.lock().contains(job_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Explicitly constructed component graph shared across the process
pub struct SystemContext {
    pub args: Args,
    pub workers: Arc<WorkerRegistry>,
    pub health: Arc<HealthMonitor>,
    pub breakers: Arc<BreakerRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub jobs: Arc<JobRegistry>,
    pub pools: Arc<StreamPools>,
    pub client: Arc<ComfyClient>,
    pub metrics: Arc<MetricsAggregator>,
    pub scheduler: Arc<SchedulerState>,
}

impl SystemContext {
    /// Wire up every component from configuration
    pub fn new(args: Args) -> Self {
        let workers = Arc::new(WorkerRegistry::from_args(&args));
        let health = Arc::new(HealthMonitor::new(Arc::clone(&workers), &args));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::from_args(&args)));
        let metrics = Arc::new(MetricsAggregator::new());
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&workers),
            Arc::clone(&health),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
            args.max_jobs_per_worker,
        ));
        let jobs = Arc::new(JobRegistry::new(
            args.job_timeout(),
            args.terminal_retention(),
        ));
        let pools = Arc::new(StreamPools::new(
            &workers,
            StreamPoolConfig::from_args(&args),
            &breakers,
        ));

        Self {
            args,
            workers,
            health,
            breakers,
            balancer,
            jobs,
            pools,
            client: Arc::new(ComfyClient::new()),
            metrics,
            scheduler: Arc::new(SchedulerState::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_in_flight_bookkeeping() {
        let state = SchedulerState::new();
        assert_eq!(state.in_flight_count(), 0);
        assert!(state.add_in_flight("j1"));
        assert!(!state.add_in_flight("j1"));
        assert!(state.is_in_flight("j1"));
        state.remove_in_flight("j1");
        assert_eq!(state.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_context_wiring() {
        let mut args = Args::parse_from(["comfy-gateway"]);
        args.worker_hosts = "a:8188,b:8188".to_string();
        let ctx = SystemContext::new(args);

        assert_eq!(ctx.workers.len(), 2);
        assert!(ctx.pools.get("a:8188").is_some());
        assert!(ctx.pools.get("c:8188").is_none());
        assert!(!ctx.scheduler.is_running());
    }
}
