//! Status and metrics endpoints
//!
//! /status is the operator view: workers, pools, jobs, scheduler, breaker
//! summary and diagnostic recommendations. /status/metrics and
//! /api/metrics expose the raw aggregator snapshot.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use super::json_response;
use crate::context::SystemContext;
use crate::health::BreakerState;
use crate::upstream::PoolStatus;

/// One row of the worker status table
#[derive(Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub healthy: bool,
    pub active_jobs: usize,
    pub probe_age_secs: Option<u64>,
}

/// Scheduler status block
#[derive(Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub tick_ms: u64,
}

/// Diagnostic recommendations for operators
#[derive(Serialize)]
pub struct Diagnostics {
    pub status: String,
    pub recommendations: Vec<String>,
}

/// Status response payload
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub workers: Vec<WorkerStatus>,
    pub pools: Vec<PoolStatus>,
    pub scheduler: SchedulerStatus,
    pub jobs: serde_json::Value,
    pub breakers_open: usize,
    pub diagnostics: Diagnostics,
}

/// Handle GET /status
pub fn status_check(ctx: Arc<SystemContext>) -> Response<Full<Bytes>> {
    let mut recommendations = Vec::new();

    let workers: Vec<WorkerStatus> = ctx
        .workers
        .all()
        .iter()
        .map(|w| WorkerStatus {
            id: w.id.clone(),
            healthy: w.is_healthy(),
            active_jobs: w.active_jobs(),
            probe_age_secs: w.probe_age().map(|d| d.as_secs()),
        })
        .collect();

    let healthy = ctx.workers.healthy_count();
    if healthy == 0 {
        recommendations.push(
            "No healthy workers - check worker processes and WORKER_HOSTS addresses".to_string(),
        );
    } else if healthy < ctx.workers.len() {
        recommendations.push(format!(
            "{} of {} workers unhealthy - inspect /api/circuit-breakers for details",
            ctx.workers.len() - healthy,
            ctx.workers.len()
        ));
    }

    if !ctx.scheduler.is_running() {
        recommendations.push("Scheduler is not running - jobs will not be dispatched".to_string());
    }

    let stats = ctx.jobs.stats();
    if stats.pending > ctx.args.max_concurrent_global * 2 {
        recommendations.push(format!(
            "{} jobs pending - workers may be saturated",
            stats.pending
        ));
    }

    let breakers_open = ctx
        .breakers
        .snapshots()
        .iter()
        .filter(|b| b.state == BreakerState::Open)
        .count();
    if breakers_open > 0 {
        recommendations.push(format!("{breakers_open} circuit breaker(s) open"));
    }

    let response = StatusResponse {
        service: "comfy-gateway",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: ctx.metrics.snapshot().uptime_secs,
        workers,
        pools: ctx.pools.statuses(),
        scheduler: SchedulerStatus {
            running: ctx.scheduler.is_running(),
            in_flight: ctx.scheduler.in_flight_count(),
            max_concurrent: ctx.args.max_concurrent_global,
            tick_ms: ctx.args.scheduler_tick_ms,
        },
        jobs: serde_json::to_value(&stats).unwrap_or_else(|_| json!({})),
        breakers_open,
        diagnostics: Diagnostics {
            status: if recommendations.is_empty() {
                "healthy".to_string()
            } else {
                "attention".to_string()
            },
            recommendations,
        },
    };

    let body = serde_json::to_value(&response)
        .unwrap_or_else(|_| json!({"error": "serialization failed"}));
    json_response(StatusCode::OK, &body)
}

/// Handle GET /status/metrics and GET /api/metrics
pub fn handle_metrics(ctx: Arc<SystemContext>) -> Response<Full<Bytes>> {
    let snapshot = ctx.metrics.snapshot();
    let body =
        serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({"error": "serialization failed"}));
    json_response(StatusCode::OK, &body)
}

/// Handle GET /api/metrics/errors
pub fn handle_recent_errors(ctx: Arc<SystemContext>) -> Response<Full<Bytes>> {
    let errors = ctx.metrics.recent_errors();
    json_response(
        StatusCode::OK,
        &json!({
            "count": errors.len(),
            "errors": errors,
        }),
    )
}
