//! Health check endpoints
//!
//! - /health, /healthz - 200 while at least one worker is healthy and the
//!   scheduler loop is running; 503 otherwise. The body always carries the
//!   worker table and headline KPIs so operators can see why.
//! - /ready, /readyz - readiness probe: the gateway can take traffic only
//!   if the scheduler runs and some worker is currently dispatchable.
//! - /version - build information for deployment verification.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use super::json_response;
use crate::context::SystemContext;

/// One row of the worker table
#[derive(Serialize)]
pub struct WorkerHealth {
    pub id: String,
    pub healthy: bool,
    pub active_jobs: usize,
    pub max_jobs: usize,
}

/// Headline numbers for dashboards
#[derive(Serialize)]
pub struct HealthKpis {
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub avg_processing_ms: f64,
}

/// Health response payload
#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub timestamp: String,
    pub scheduler_running: bool,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub healthy_workers: usize,
    pub total_workers: usize,
    pub workers: Vec<WorkerHealth>,
    pub kpis: HealthKpis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn build_health_response(ctx: &SystemContext) -> HealthResponse {
    let workers: Vec<WorkerHealth> = ctx
        .workers
        .all()
        .iter()
        .map(|w| WorkerHealth {
            id: w.id.clone(),
            healthy: w.is_healthy(),
            active_jobs: w.active_jobs(),
            max_jobs: ctx.args.max_jobs_per_worker,
        })
        .collect();

    let healthy_workers = ctx.workers.healthy_count();
    let scheduler_running = ctx.scheduler.is_running();
    let healthy = healthy_workers > 0 && scheduler_running;

    let metrics = ctx.metrics.snapshot();

    let error = if !scheduler_running {
        Some("Scheduler is not running".to_string())
    } else if healthy_workers == 0 {
        Some(format!(
            "No healthy workers (0/{}) - jobs will stay pending",
            ctx.workers.len()
        ))
    } else {
        None
    };

    HealthResponse {
        healthy,
        status: if healthy { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: metrics.uptime_secs,
        timestamp: chrono::Utc::now().to_rfc3339(),
        scheduler_running,
        in_flight: ctx.scheduler.in_flight_count(),
        max_concurrent: ctx.args.max_concurrent_global,
        healthy_workers,
        total_workers: ctx.workers.len(),
        workers,
        kpis: HealthKpis {
            jobs_created: metrics.global.created,
            jobs_completed: metrics.global.completed,
            jobs_failed: metrics.global.failed,
            avg_processing_ms: metrics.processing_time.avg_ms,
        },
        error,
    }
}

/// Handle /health and /healthz
pub fn health_check(ctx: Arc<SystemContext>) -> Response<Full<Bytes>> {
    let response = build_health_response(&ctx);
    let status = if response.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::to_value(&response)
        .unwrap_or_else(|_| serde_json::json!({"healthy": false, "error": "serialization"}));
    json_response(status, &body)
}

/// Handle /ready and /readyz
pub fn readiness_check(ctx: Arc<SystemContext>) -> Response<Full<Bytes>> {
    let response = build_health_response(&ctx);
    let ready = response.scheduler_running && ctx.balancer.has_dispatchable();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::to_value(&response)
        .unwrap_or_else(|_| serde_json::json!({"healthy": false, "error": "serialization"}));
    json_response(status, &body)
}

/// Handle /version
pub fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "service": "comfy-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "commit": option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
            "build_time": option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        }),
    )
}
