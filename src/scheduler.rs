//! Dispatch loop for pending jobs
//!
//! A single cooperative loop scans pending jobs FIFO each tick and starts
//! an independent task per dispatched job, respecting the global and
//! per-worker concurrency caps. A tick with no dispatchable worker leaves
//! jobs pending; only the per-job deadline evicts them.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::SystemContext;
use crate::execution;
use crate::health::BreakerRegistry;
use crate::jobs::{JobState, TransitionPatch};

/// Start the scheduler loop
pub fn spawn_scheduler(ctx: Arc<SystemContext>) -> JoinHandle<()> {
    ctx.scheduler.set_running(true);
    info!(
        tick_ms = ctx.args.scheduler_tick_ms,
        max_concurrent = ctx.args.max_concurrent_global,
        max_per_worker = ctx.args.max_jobs_per_worker,
        "Starting scheduler"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ctx.args.scheduler_tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if ctx.scheduler.shutdown_requested() {
                ctx.scheduler.set_running(false);
                info!("Scheduler stopped");
                return;
            }
            run_tick(&ctx).await;
        }
    })
}

/// One scheduling pass: dispatch pending jobs while capacity allows
async fn run_tick(ctx: &Arc<SystemContext>) {
    let free = ctx
        .args
        .max_concurrent_global
        .saturating_sub(ctx.scheduler.in_flight_count());
    if free == 0 {
        return;
    }

    let pending = ctx.jobs.list_by_state(JobState::Pending);
    if pending.is_empty() {
        return;
    }

    let mut free = free;
    for job in pending {
        if free == 0 {
            break;
        }
        // A job already handed to a task but not yet transitioned would be
        // re-listed as pending; the in-flight set is the tie-breaker.
        if ctx.scheduler.is_in_flight(&job.id) {
            continue;
        }

        let Some(worker) = ctx.balancer.select().await else {
            // No dispatchable worker right now; keep everything pending
            debug!(pending_job = %job.id, "No worker available this tick");
            break;
        };

        // Claim the breaker admission before committing the job to this
        // worker; a rejection here counts as "no worker right now".
        let breaker = ctx
            .breakers
            .breaker(&BreakerRegistry::submit_name(&worker.id));
        if breaker.try_acquire().is_err() {
            debug!(worker = %worker.id, "Submit breaker rejected dispatch");
            break;
        }

        // Atomic dispatch step: transition, count, track
        let transitioned = ctx.jobs.transition(
            &job.id,
            JobState::Processing,
            TransitionPatch {
                assigned_worker: Some(worker.id.clone()),
                ..TransitionPatch::default()
            },
        );
        let job = match transitioned {
            Ok(job) => job,
            Err(e) => {
                // Evicted or already handled; release the admission
                breaker.record_success();
                warn!(job_id = %job.id, "Dispatch transition failed: {e}");
                continue;
            }
        };
        ctx.balancer.increment(&worker);
        ctx.scheduler.add_in_flight(&job.id);
        free -= 1;

        debug!(
            job_id = %job.id,
            worker = %worker.id,
            in_flight = ctx.scheduler.in_flight_count(),
            "Job dispatched"
        );

        let task_ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let job_id = job.id.clone();
            let task_worker = Arc::clone(&worker);

            execution::execute_job(&task_ctx, job, worker, breaker).await;

            // Always release capacity, whatever the outcome
            task_ctx.balancer.decrement(&task_worker);
            task_ctx.scheduler.remove_in_flight(&job_id);
        });
    }
}

/// Stop accepting work and wait for in-flight jobs up to the deadline
pub async fn shutdown(ctx: &Arc<SystemContext>, deadline: Duration) {
    ctx.scheduler.request_shutdown();
    info!(
        in_flight = ctx.scheduler.in_flight_count(),
        deadline_secs = deadline.as_secs(),
        "Scheduler shutdown requested"
    );

    let waited = tokio::time::timeout(deadline, async {
        while ctx.scheduler.in_flight_count() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    match waited {
        Ok(()) => info!("All in-flight jobs finished"),
        Err(_) => warn!(
            abandoned = ctx.scheduler.in_flight_count(),
            "Shutdown deadline reached with jobs still in flight"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use crate::jobs::{JobInput, JobKind, OutputFormat};
    use clap::Parser;

    fn test_ctx(worker_hosts: &str) -> Arc<SystemContext> {
        let mut args = Args::parse_from(["comfy-gateway"]);
        args.worker_hosts = worker_hosts.to_string();
        // Unroutable dispatch probes must fail fast in tests
        args.dispatch_probe_timeout_secs = 1;
        Arc::new(SystemContext::new(args))
    }

    fn push_job(ctx: &Arc<SystemContext>) -> String {
        ctx.jobs
            .create(
                JobKind::RemoveBackground,
                JobInput {
                    image_base64: "aGVsbG8=".to_string(),
                    format: OutputFormat::Png,
                    crop: false,
                },
            )
            .id
    }

    #[tokio::test]
    async fn test_no_healthy_worker_keeps_jobs_pending() {
        let ctx = test_ctx("a:8188");
        for worker in ctx.workers.all() {
            worker.set_healthy(false);
        }
        let id = push_job(&ctx);

        run_tick(&ctx).await;

        // Not failed, not dispatched: still pending for a later tick
        let job = ctx.jobs.get(&id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(ctx.scheduler.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_global_cap_bounds_dispatch() {
        let ctx = test_ctx("a:8188");
        // Saturate the in-flight set
        for i in 0..ctx.args.max_concurrent_global {
            ctx.scheduler.add_in_flight(&format!("occupied-{i}"));
        }
        let id = push_job(&ctx);

        run_tick(&ctx).await;

        assert_eq!(ctx.jobs.get(&id).unwrap().state, JobState::Pending);
        assert_eq!(
            ctx.scheduler.in_flight_count(),
            ctx.args.max_concurrent_global
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let ctx = test_ctx("a:8188");
        let handle = spawn_scheduler(Arc::clone(&ctx));
        assert!(ctx.scheduler.is_running());

        shutdown(&ctx, Duration::from_secs(1)).await;
        // The loop notices the flag on its next tick
        tokio::time::sleep(ctx.args.scheduler_tick() + Duration::from_millis(200)).await;
        assert!(!ctx.scheduler.is_running());
        handle.abort();
    }

    #[tokio::test]
    async fn test_open_breaker_leaves_job_pending() {
        let ctx = test_ctx("a:8188");
        ctx.breakers
            .breaker(&BreakerRegistry::submit_name("a:8188"))
            .force_open();
        let id = push_job(&ctx);

        run_tick(&ctx).await;

        assert_eq!(ctx.jobs.get(&id).unwrap().state, JobState::Pending);
    }
}
