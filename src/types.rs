//! Shared error and result types for comfy-gateway

use thiserror::Error;

/// Gateway error type covering the failure classes of the job pipeline
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad client input or upstream node-validation errors on submit.
    /// Never marks a worker unhealthy and is never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Connection refused / reset / DNS failure / request timeout while
    /// talking to a worker. Marks the worker unhealthy and feeds the breaker.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Explicit execution_error event from the worker for our submission.
    /// The fault is the graph or the data, not the worker.
    #[error("Upstream execution error: {0}")]
    UpstreamExecution(String),

    /// No completion signal within the execution deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Circuit breaker rejected the call before it was attempted.
    #[error("Circuit breaker open: {0}")]
    BreakerOpen(String),

    /// The history entry for a completed submission yielded no images.
    #[error("Missing output: {0}")]
    MissingOutput(String),

    /// Image bytes could not be retrieved after apparent completion.
    #[error("Download failure: {0}")]
    DownloadFailure(String),

    /// Configuration problem detected at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violation (channel closed, poisoned lock, ...)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Short machine-readable kind used in job payloads and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::Transport(_) => "transport",
            GatewayError::UpstreamExecution(_) => "upstream-execution",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::BreakerOpen(_) => "breaker-open",
            GatewayError::MissingOutput(_) => "missing-output",
            GatewayError::DownloadFailure(_) => "download-failure",
            GatewayError::Config(_) => "config",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Whether this failure should flip the assigned worker to unhealthy
    pub fn marks_worker_unhealthy(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Transport(format!("IO error: {e}"))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Transport(format!("Request timed out: {e}"))
        } else if e.is_connect() {
            GatewayError::Transport(format!("Connection failed: {e}"))
        } else {
            GatewayError::Transport(format!("HTTP error: {e}"))
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(GatewayError::Validation("x".into()).kind(), "validation");
        assert_eq!(GatewayError::Transport("x".into()).kind(), "transport");
        assert_eq!(GatewayError::BreakerOpen("w1".into()).kind(), "breaker-open");
    }

    #[test]
    fn test_unhealthy_marking() {
        assert!(GatewayError::Transport("refused".into()).marks_worker_unhealthy());
        assert!(GatewayError::Timeout("60s".into()).marks_worker_unhealthy());
        assert!(!GatewayError::Validation("bad".into()).marks_worker_unhealthy());
        assert!(!GatewayError::UpstreamExecution("node".into()).marks_worker_unhealthy());
        assert!(!GatewayError::MissingOutput("none".into()).marks_worker_unhealthy());
    }
}
