//! Configuration for comfy-gateway
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Comfy Gateway - concurrency-managing middleware for ComfyUI workers
#[derive(Parser, Debug, Clone)]
#[command(name = "comfy-gateway")]
#[command(about = "Job-scheduling gateway between HTTP clients and ComfyUI workers")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Comma-separated list of worker host:port addresses
    /// e.g. "10.0.0.1:8188,10.0.0.2:8188"
    #[arg(long, env = "WORKER_HOSTS", default_value = "127.0.0.1:8188")]
    pub worker_hosts: String,

    /// Use TLS (https/wss) when talking to workers
    #[arg(long, env = "USE_TLS", default_value = "false")]
    pub use_tls: bool,

    /// Maximum streaming channels kept per worker (bounded 1-10)
    #[arg(long, env = "MAX_STREAMS_PER_WORKER", default_value = "3")]
    pub max_streams_per_worker: usize,

    /// Global cap on concurrently executing jobs
    #[arg(long, env = "MAX_CONCURRENT_GLOBAL", default_value = "4")]
    pub max_concurrent_global: usize,

    /// Per-worker cap on concurrently assigned jobs
    #[arg(long, env = "MAX_JOBS_PER_WORKER", default_value = "2")]
    pub max_jobs_per_worker: usize,

    /// Seconds before a pending or stuck job is evicted
    #[arg(long, env = "JOB_TIMEOUT_SECS", default_value = "300")]
    pub job_timeout_secs: u64,

    /// Seconds a terminal job (completed/failed) is retained for clients
    #[arg(long, env = "TERMINAL_RETENTION_SECS", default_value = "30")]
    pub terminal_retention_secs: u64,

    /// Scheduler tick interval in milliseconds
    #[arg(long, env = "SCHEDULER_TICK_MS", default_value = "1000")]
    pub scheduler_tick_ms: u64,

    /// Background health probe interval in seconds
    #[arg(long, env = "PROBE_INTERVAL_SECS", default_value = "30")]
    pub probe_interval_secs: u64,

    /// Deadline for dispatch-time health probes in seconds
    #[arg(long, env = "DISPATCH_PROBE_TIMEOUT_SECS", default_value = "2")]
    pub dispatch_probe_timeout_secs: u64,

    /// Deadline for background health probes in seconds
    #[arg(long, env = "BG_PROBE_TIMEOUT_SECS", default_value = "5")]
    pub bg_probe_timeout_secs: u64,

    /// Consecutive failures before a circuit breaker opens
    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value = "3")]
    pub breaker_failure_threshold: u32,

    /// Consecutive half-open successes before a breaker closes
    #[arg(long, env = "BREAKER_SUCCESS_THRESHOLD", default_value = "2")]
    pub breaker_success_threshold: u32,

    /// Initial breaker reset timeout in seconds (grows 1.5x per reopen)
    #[arg(long, env = "BREAKER_RESET_TIMEOUT_SECS", default_value = "15")]
    pub breaker_reset_timeout_secs: u64,

    /// Ceiling for the growing breaker reset timeout in seconds
    #[arg(long, env = "BREAKER_MAX_RESET_TIMEOUT_SECS", default_value = "120")]
    pub breaker_max_reset_timeout_secs: u64,

    /// Minimum rolling-window samples before the error-rate rule applies
    #[arg(long, env = "BREAKER_VOLUME_THRESHOLD", default_value = "10")]
    pub breaker_volume_threshold: usize,

    /// Rolling error rate (percent) that opens a breaker
    #[arg(long, env = "BREAKER_ERROR_THRESHOLD_PCT", default_value = "50")]
    pub breaker_error_threshold_pct: u32,

    /// Rolling window size for breaker error-rate tracking in seconds
    #[arg(long, env = "BREAKER_WINDOW_SECS", default_value = "60")]
    pub breaker_window_secs: u64,

    /// Hard ceiling on a single job execution in seconds
    #[arg(long, env = "EXECUTION_TIMEOUT_SECS", default_value = "60")]
    pub execution_timeout_secs: u64,

    /// Seconds a caller may wait for a pooled stream
    #[arg(long, env = "ACQUIRE_TIMEOUT_SECS", default_value = "30")]
    pub acquire_timeout_secs: u64,

    /// Deadline for opening a new streaming channel in seconds
    #[arg(long, env = "STREAM_CONNECT_TIMEOUT_SECS", default_value = "10")]
    pub stream_connect_timeout_secs: u64,

    /// Settle delay between stream completion and history fetch, in ms
    #[arg(long, env = "SETTLE_DELAY_MS", default_value = "1000")]
    pub settle_delay_ms: u64,

    /// Write result images to the outputs directory
    #[arg(long, env = "OUTPUT_FILES", default_value = "false")]
    pub output_files: bool,

    /// Directory for the optional image sink
    #[arg(long, env = "OUTPUT_DIR", default_value = "outputs")]
    pub output_dir: String,

    /// File path for periodic metrics snapshots (unset disables persistence)
    #[arg(long, env = "METRICS_FILE_PATH")]
    pub metrics_file_path: Option<String>,

    /// Seconds between metrics snapshot writes
    #[arg(long, env = "METRICS_SAVE_INTERVAL_SECS", default_value = "300")]
    pub metrics_save_interval_secs: u64,

    /// Seconds in-flight jobs are given to finish on shutdown
    #[arg(long, env = "GRACEFUL_SHUTDOWN_SECS", default_value = "30")]
    pub graceful_shutdown_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Get the list of worker host addresses
    pub fn worker_host_list(&self) -> Vec<String> {
        self.worker_hosts
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Upstream HTTP scheme
    pub fn http_scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    /// Upstream WebSocket scheme
    pub fn ws_scheme(&self) -> &'static str {
        if self.use_tls {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_host_list().is_empty() {
            return Err("WORKER_HOSTS must name at least one worker".to_string());
        }

        if !(1..=10).contains(&self.max_streams_per_worker) {
            return Err("MAX_STREAMS_PER_WORKER must be between 1 and 10".to_string());
        }

        if self.max_concurrent_global == 0 {
            return Err("MAX_CONCURRENT_GLOBAL must be at least 1".to_string());
        }

        if self.max_jobs_per_worker == 0 {
            return Err("MAX_JOBS_PER_WORKER must be at least 1".to_string());
        }

        if self.breaker_error_threshold_pct > 100 {
            return Err("BREAKER_ERROR_THRESHOLD_PCT must be at most 100".to_string());
        }

        if self.breaker_reset_timeout_secs > self.breaker_max_reset_timeout_secs {
            return Err(
                "BREAKER_RESET_TIMEOUT_SECS must not exceed BREAKER_MAX_RESET_TIMEOUT_SECS"
                    .to_string(),
            );
        }

        Ok(())
    }
}
