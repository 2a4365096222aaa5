//! Metrics aggregation and optional snapshot persistence
//!
//! Counts jobs globally, per worker and per kind; keeps running min/max/sum
//! processing-time stats plus a bounded recent-sample ring for percentile
//! estimation, and a bounded list of recent errors. Snapshots can be
//! persisted periodically; writes are atomic (sibling temp file + rename).

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::jobs::JobKind;
use crate::types::{GatewayError, Result};

/// Ring capacity for percentile samples
const MAX_SAMPLES: usize = 100;

/// Bound on the recent-error list
const MAX_RECENT_ERRORS: usize = 100;

/// Created / completed / failed counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct Counts {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
}

/// One recorded failure
#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub error_kind: String,
    pub message: String,
}

/// Processing-time summary with percentile estimates
#[derive(Debug, Clone, Serialize)]
pub struct TimingSummary {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Serializable aggregate view
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub global: Counts,
    pub per_worker: HashMap<String, Counts>,
    pub per_kind: HashMap<String, Counts>,
    pub dispatch_failures: HashMap<String, u64>,
    pub processing_time: TimingSummary,
    pub recent_errors: Vec<RecentError>,
}

struct MetricsInner {
    global: Counts,
    per_worker: HashMap<String, Counts>,
    per_kind: HashMap<String, Counts>,
    dispatch_failures: HashMap<String, u64>,
    timing_count: u64,
    timing_min_ms: f64,
    timing_max_ms: f64,
    timing_sum_ms: f64,
    samples: VecDeque<f64>,
    recent_errors: VecDeque<RecentError>,
}

/// Aggregator shared by the execution protocol and the request handlers
pub struct MetricsAggregator {
    inner: Mutex<MetricsInner>,
    started_at: Instant,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                global: Counts::default(),
                per_worker: HashMap::new(),
                per_kind: HashMap::new(),
                dispatch_failures: HashMap::new(),
                timing_count: 0,
                timing_min_ms: f64::INFINITY,
                timing_max_ms: 0.0,
                timing_sum_ms: 0.0,
                samples: VecDeque::with_capacity(MAX_SAMPLES),
                recent_errors: VecDeque::with_capacity(MAX_RECENT_ERRORS),
            }),
            started_at: Instant::now(),
        }
    }

    pub fn record_created(&self, kind: JobKind) {
        let mut inner = self.lock();
        inner.global.created += 1;
        inner
            .per_kind
            .entry(kind.as_str().to_string())
            .or_default()
            .created += 1;
    }

    pub fn record_completed(&self, kind: JobKind, worker: &str, processing: Duration) {
        let ms = processing.as_secs_f64() * 1000.0;
        let mut inner = self.lock();
        inner.global.completed += 1;
        inner
            .per_kind
            .entry(kind.as_str().to_string())
            .or_default()
            .completed += 1;
        inner
            .per_worker
            .entry(worker.to_string())
            .or_default()
            .completed += 1;

        inner.timing_count += 1;
        inner.timing_min_ms = inner.timing_min_ms.min(ms);
        inner.timing_max_ms = inner.timing_max_ms.max(ms);
        inner.timing_sum_ms += ms;
        if inner.samples.len() == MAX_SAMPLES {
            inner.samples.pop_front();
        }
        inner.samples.push_back(ms);
    }

    pub fn record_failed(
        &self,
        kind: JobKind,
        worker: Option<&str>,
        error_kind: &str,
        message: &str,
    ) {
        let mut inner = self.lock();
        inner.global.failed += 1;
        inner
            .per_kind
            .entry(kind.as_str().to_string())
            .or_default()
            .failed += 1;
        if let Some(worker) = worker {
            inner
                .per_worker
                .entry(worker.to_string())
                .or_default()
                .failed += 1;
        }

        if inner.recent_errors.len() == MAX_RECENT_ERRORS {
            inner.recent_errors.pop_front();
        }
        inner.recent_errors.push_back(RecentError {
            timestamp: Utc::now(),
            kind: kind.as_str().to_string(),
            worker: worker.map(str::to_string),
            error_kind: error_kind.to_string(),
            message: message.to_string(),
        });
    }

    /// A worker failed the real-time gate just before dispatch
    pub fn record_dispatch_failure(&self, worker: &str) {
        let mut inner = self.lock();
        *inner.dispatch_failures.entry(worker.to_string()).or_insert(0) += 1;
    }

    pub fn recent_errors(&self) -> Vec<RecentError> {
        self.lock().recent_errors.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        let timing = TimingSummary {
            count: inner.timing_count,
            min_ms: if inner.timing_count > 0 {
                inner.timing_min_ms
            } else {
                0.0
            },
            max_ms: inner.timing_max_ms,
            avg_ms: if inner.timing_count > 0 {
                inner.timing_sum_ms / inner.timing_count as f64
            } else {
                0.0
            },
            p50_ms: percentile(&inner.samples, 50.0),
            p90_ms: percentile(&inner.samples, 90.0),
            p95_ms: percentile(&inner.samples, 95.0),
            p99_ms: percentile(&inner.samples, 99.0),
        };

        MetricsSnapshot {
            timestamp: Utc::now(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            global: inner.global.clone(),
            per_worker: inner.per_worker.clone(),
            per_kind: inner.per_kind.clone(),
            dispatch_failures: inner.dispatch_failures.clone(),
            processing_time: timing,
            recent_errors: inner.recent_errors.iter().cloned().collect(),
        }
    }

    /// Persist a snapshot atomically: write a sibling temp file, then rename
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let payload = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| GatewayError::Internal(format!("Snapshot serialization failed: {e}")))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "Metrics snapshot written");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MetricsInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Nearest-rank percentile over the sample ring
fn percentile(samples: &VecDeque<f64>, pct: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Write snapshots on a background tick until the task is aborted
pub fn spawn_save_task(
    metrics: Arc<MetricsAggregator>,
    path: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    info!(
        path = %path.display(),
        interval_secs = interval.as_secs(),
        "Starting metrics persistence"
    );
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the file appears
        // after one full interval.
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = metrics.save_to_file(&path).await {
                error!("Failed to write metrics snapshot: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_dimension() {
        let metrics = MetricsAggregator::new();
        metrics.record_created(JobKind::Upscale);
        metrics.record_created(JobKind::RemoveBackground);
        metrics.record_completed(JobKind::Upscale, "w1", Duration::from_secs(2));
        metrics.record_failed(JobKind::RemoveBackground, Some("w2"), "transport", "refused");

        let snap = metrics.snapshot();
        assert_eq!(snap.global.created, 2);
        assert_eq!(snap.global.completed, 1);
        assert_eq!(snap.global.failed, 1);
        assert_eq!(snap.per_worker.get("w1").unwrap().completed, 1);
        assert_eq!(snap.per_worker.get("w2").unwrap().failed, 1);
        assert_eq!(snap.per_kind.get("upscale").unwrap().completed, 1);
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let metrics = MetricsAggregator::new();
        for i in 1..=100u64 {
            metrics.record_completed(JobKind::Upscale, "w1", Duration::from_millis(i * 10));
        }

        let timing = metrics.snapshot().processing_time;
        assert_eq!(timing.p50_ms, 500.0);
        assert_eq!(timing.p90_ms, 900.0);
        assert_eq!(timing.p95_ms, 950.0);
        assert_eq!(timing.p99_ms, 990.0);
        assert_eq!(timing.min_ms, 10.0);
        assert_eq!(timing.max_ms, 1000.0);
    }

    #[test]
    fn test_sample_ring_is_bounded() {
        let metrics = MetricsAggregator::new();
        for i in 0..250u64 {
            metrics.record_completed(JobKind::Upscale, "w1", Duration::from_millis(i));
        }

        let snap = metrics.snapshot();
        // Running stats see everything; the ring keeps the latest 100
        assert_eq!(snap.processing_time.count, 250);
        assert_eq!(snap.processing_time.min_ms, 0.0);
        // p50 over samples 150..249
        assert_eq!(snap.processing_time.p50_ms, 199.0);
    }

    #[test]
    fn test_recent_errors_bounded() {
        let metrics = MetricsAggregator::new();
        for i in 0..150 {
            metrics.record_failed(JobKind::Upscale, None, "timeout", &format!("err {i}"));
        }

        let errors = metrics.recent_errors();
        assert_eq!(errors.len(), 100);
        assert_eq!(errors.first().unwrap().message, "err 50");
        assert_eq!(errors.last().unwrap().message, "err 149");
    }

    #[test]
    fn test_empty_snapshot_is_zeroed() {
        let snap = MetricsAggregator::new().snapshot();
        assert_eq!(snap.processing_time.count, 0);
        assert_eq!(snap.processing_time.min_ms, 0.0);
        assert_eq!(snap.processing_time.p99_ms, 0.0);
    }

    #[tokio::test]
    async fn test_atomic_save_writes_valid_json() {
        let metrics = MetricsAggregator::new();
        metrics.record_completed(JobKind::Upscale, "w1", Duration::from_secs(1));

        let path = std::env::temp_dir().join(format!("metrics-{}.json", uuid::Uuid::new_v4()));
        metrics.save_to_file(&path).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["global"]["completed"], 1);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
