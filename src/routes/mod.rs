//! HTTP route handlers

pub mod breakers;
pub mod health;
pub mod jobs;
pub mod process;
pub mod status;

pub use breakers::{handle_breaker_command, handle_list_breakers};
pub use health::{health_check, readiness_check, version_info};
pub use jobs::{
    handle_job_cleanup, handle_job_delete, handle_job_list, handle_job_result, handle_job_stats,
    handle_job_status,
};
pub use process::handle_process;
pub use status::{handle_metrics, handle_recent_errors, status_check};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// JSON response with permissive CORS, the way every endpoint answers
pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    let body = value.to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Standard error payload
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &serde_json::json!({
            "error": message,
        }),
    )
}
