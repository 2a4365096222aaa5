//! Circuit breaker admin endpoints
//!
//! Listing plus forced open/close. Forced transitions bypass the counters
//! but emit the same state-transition events as organic ones.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

use super::{error_response, json_response};
use crate::context::SystemContext;

/// Handle GET /api/circuit-breakers
pub fn handle_list_breakers(ctx: Arc<SystemContext>) -> Response<Full<Bytes>> {
    let snapshots = ctx.breakers.snapshots();
    let body = serde_json::to_value(&snapshots).unwrap_or_else(|_| json!([]));
    json_response(
        StatusCode::OK,
        &json!({
            "count": snapshots.len(),
            "breakers": body,
        }),
    )
}

/// Handle POST /api/circuit-breakers/{name}/{open|close}
pub fn handle_breaker_command(
    ctx: Arc<SystemContext>,
    name: &str,
    command: &str,
) -> Response<Full<Bytes>> {
    let Some(breaker) = ctx.breakers.get(name) else {
        return error_response(StatusCode::NOT_FOUND, &format!("Unknown breaker '{name}'"));
    };

    match command {
        "open" => breaker.force_open(),
        "close" => breaker.force_close(),
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("Unknown breaker command '{other}' (open, close)"),
            )
        }
    }

    let snapshot = breaker.snapshot();
    json_response(
        StatusCode::OK,
        &serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({})),
    )
}
