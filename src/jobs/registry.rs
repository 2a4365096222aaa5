//! Job registry: the single source of truth for job state
//!
//! All job mutations go through this registry. Each entry carries at most
//! one cleanup timer; creating a job schedules eviction at `job_timeout`,
//! and a terminal transition reschedules it to the shorter
//! `terminal_retention` window so clients can still fetch the payload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Job, JobFailure, JobInput, JobKind, JobResult, JobState};
use crate::types::{GatewayError, Result};

/// Fields applied alongside a state transition
#[derive(Debug, Default)]
pub struct TransitionPatch {
    pub assigned_worker: Option<String>,
    pub prompt_id: Option<String>,
    pub result: Option<JobResult>,
    pub error: Option<JobFailure>,
}

/// Filter for job listings
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub kind: Option<JobKind>,
    pub worker: Option<String>,
}

/// Counts by state, kind and worker
#[derive(Debug, serde::Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub by_kind: HashMap<String, usize>,
    pub by_worker: HashMap<String, usize>,
}

struct JobEntry {
    job: Job,
    /// At most one cleanup timer per job; rescheduling aborts the previous
    cleanup: Option<JoinHandle<()>>,
}

/// Central job store guarded by a single mutex. Operations never call out
/// while holding the lock; timers are (re)scheduled after release.
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
    seq: AtomicU64,
    job_timeout: Duration,
    terminal_retention: Duration,
}

impl JobRegistry {
    pub fn new(job_timeout: Duration, terminal_retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            job_timeout,
            terminal_retention,
        }
    }

    /// Create a new pending job and schedule its eviction timer
    pub fn create(self: &Arc<Self>, kind: JobKind, input: JobInput) -> Job {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            kind,
            input,
            created_at: now,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            state: JobState::Pending,
            assigned_worker: None,
            prompt_id: None,
            processing_started_at: None,
            finished_at: None,
            result: None,
            error: None,
            last_touched_at: now,
        };

        let snapshot = job.clone();
        {
            let mut jobs = self.lock();
            jobs.insert(job.id.clone(), JobEntry { job, cleanup: None });
        }
        self.schedule_cleanup(&snapshot.id, self.job_timeout);

        debug!(job_id = %snapshot.id, kind = %snapshot.kind, "Job created");
        snapshot
    }

    /// Get a defensive copy of a job
    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().get(id).map(|e| e.job.clone())
    }

    /// Apply a state transition, rejecting anything outside
    /// pending -> processing -> {completed, failed}
    pub fn transition(
        self: &Arc<Self>,
        id: &str,
        new_state: JobState,
        patch: TransitionPatch,
    ) -> Result<Job> {
        let snapshot = {
            let mut jobs = self.lock();
            let entry = jobs
                .get_mut(id)
                .ok_or_else(|| GatewayError::Internal(format!("Unknown job {id}")))?;

            let job = &mut entry.job;
            if !job.state.can_transition_to(new_state) {
                return Err(GatewayError::Internal(format!(
                    "Illegal transition {} -> {} for job {id}",
                    job.state, new_state
                )));
            }

            let now = Utc::now();
            match new_state {
                JobState::Processing => {
                    let worker = patch.assigned_worker.ok_or_else(|| {
                        GatewayError::Internal(format!(
                            "Transition to processing requires a worker for job {id}"
                        ))
                    })?;
                    job.assigned_worker = Some(worker);
                    job.processing_started_at = Some(now);
                }
                JobState::Completed => {
                    let result = patch.result.ok_or_else(|| {
                        GatewayError::Internal(format!(
                            "Transition to completed requires a result for job {id}"
                        ))
                    })?;
                    job.result = Some(result);
                    job.finished_at = Some(now);
                }
                JobState::Failed => {
                    let error = patch.error.ok_or_else(|| {
                        GatewayError::Internal(format!(
                            "Transition to failed requires an error for job {id}"
                        ))
                    })?;
                    job.error = Some(error);
                    job.finished_at = Some(now);
                }
                JobState::Pending => unreachable!("no transition targets pending"),
            }

            if let Some(prompt_id) = patch.prompt_id {
                job.prompt_id = Some(prompt_id);
            }
            job.state = new_state;
            job.last_touched_at = now;
            job.clone()
        };

        // Terminal states get the short retention window instead
        if new_state.is_terminal() {
            self.schedule_cleanup(id, self.terminal_retention);
        }

        Ok(snapshot)
    }

    /// Record the upstream submission id without a state change
    pub fn set_prompt_id(&self, id: &str, prompt_id: &str) {
        let mut jobs = self.lock();
        if let Some(entry) = jobs.get_mut(id) {
            entry.job.prompt_id = Some(prompt_id.to_string());
            entry.job.last_touched_at = Utc::now();
        }
    }

    /// Remove a job and cancel its timer. Idempotent.
    pub fn delete(&self, id: &str) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                if let Some(handle) = entry.cleanup {
                    handle.abort();
                }
                debug!(job_id = %id, "Job deleted");
                true
            }
            None => false,
        }
    }

    /// Drop all terminal jobs immediately. Idempotent.
    pub fn cleanup_terminal(&self) -> usize {
        let removed: Vec<JobEntry> = {
            let mut jobs = self.lock();
            let ids: Vec<String> = jobs
                .iter()
                .filter(|(_, e)| e.job.state.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| jobs.remove(&id)).collect()
        };

        for entry in &removed {
            if let Some(handle) = &entry.cleanup {
                handle.abort();
            }
        }
        removed.len()
    }

    /// Counts by state / kind / worker
    pub fn stats(&self) -> JobStats {
        let jobs = self.lock();
        let mut stats = JobStats {
            total: jobs.len(),
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            by_kind: HashMap::new(),
            by_worker: HashMap::new(),
        };

        for entry in jobs.values() {
            match entry.job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Processing => stats.processing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
            *stats
                .by_kind
                .entry(entry.job.kind.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(worker) = &entry.job.assigned_worker {
                *stats.by_worker.entry(worker.clone()).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Snapshots matching the filter, ordered by creation
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.lock();
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|e| filter.state.is_none_or(|s| e.job.state == s))
            .filter(|e| filter.kind.is_none_or(|k| e.job.kind == k))
            .filter(|e| {
                filter
                    .worker
                    .as_ref()
                    .is_none_or(|w| e.job.assigned_worker.as_deref() == Some(w.as_str()))
            })
            .map(|e| e.job.clone())
            .collect();
        out.sort_by_key(|j| j.seq);
        out
    }

    /// Snapshots in one state, FIFO by creation. Used by the scheduler.
    pub fn list_by_state(&self, state: JobState) -> Vec<Job> {
        self.list(&JobFilter {
            state: Some(state),
            ..JobFilter::default()
        })
    }

    /// (Re)schedule the eviction timer for a job, replacing any existing one
    fn schedule_cleanup(self: &Arc<Self>, id: &str, after: Duration) {
        let registry = Arc::clone(self);
        let job_id = id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            registry.evict(&job_id);
        });

        let mut jobs = self.lock();
        if let Some(entry) = jobs.get_mut(id) {
            if let Some(previous) = entry.cleanup.replace(handle) {
                previous.abort();
            }
        } else {
            // Job vanished between creation and scheduling
            handle.abort();
        }
    }

    /// Timer-driven removal. Non-terminal jobs evicted here are stuck.
    fn evict(&self, id: &str) {
        let entry = self.lock().remove(id);
        if let Some(entry) = entry {
            if !entry.job.state.is_terminal() {
                warn!(
                    job_id = %id,
                    state = %entry.job.state,
                    "Evicting stuck job past its deadline"
                );
            } else {
                debug!(job_id = %id, "Evicting job after retention window");
            }
            // The timer task evicting us is the one stored in the entry;
            // it is already finishing, so dropping the handle is enough.
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Arc<JobRegistry> {
        Arc::new(JobRegistry::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
        ))
    }

    fn test_input() -> JobInput {
        JobInput {
            image_base64: "aGVsbG8=".to_string(),
            format: crate::jobs::OutputFormat::Png,
            crop: false,
        }
    }

    fn completed_result() -> JobResult {
        JobResult {
            image: "data:image/png;base64,aGVsbG8=".to_string(),
            content_type: "image/png".to_string(),
            filename: "out.png".to_string(),
            prompt_id: "abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_returns_copy() {
        let registry = test_registry();
        let job = registry.create(JobKind::Upscale, test_input());

        let mut copy = registry.get(&job.id).unwrap();
        copy.state = JobState::Failed;

        // Mutating the snapshot must not affect the stored job
        assert_eq!(registry.get(&job.id).unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let registry = test_registry();
        let job = registry.create(JobKind::RemoveBackground, test_input());

        let processing = registry
            .transition(
                &job.id,
                JobState::Processing,
                TransitionPatch {
                    assigned_worker: Some("10.0.0.1:8188".to_string()),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();
        assert_eq!(processing.state, JobState::Processing);
        assert!(processing.processing_started_at.is_some());

        let completed = registry
            .transition(
                &job.id,
                JobState::Completed,
                TransitionPatch {
                    result: Some(completed_result()),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();
        assert_eq!(completed.state, JobState::Completed);
        assert!(completed.result.is_some());
        assert!(completed.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let registry = test_registry();
        let job = registry.create(JobKind::Upscale, test_input());

        // pending -> completed skips processing
        assert!(registry
            .transition(
                &job.id,
                JobState::Completed,
                TransitionPatch {
                    result: Some(completed_result()),
                    ..TransitionPatch::default()
                },
            )
            .is_err());

        // processing requires a worker
        assert!(registry
            .transition(&job.id, JobState::Processing, TransitionPatch::default())
            .is_err());

        registry
            .transition(
                &job.id,
                JobState::Processing,
                TransitionPatch {
                    assigned_worker: Some("w1".to_string()),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();
        registry
            .transition(
                &job.id,
                JobState::Failed,
                TransitionPatch {
                    error: Some(JobFailure {
                        kind: "transport".to_string(),
                        message: "connection refused".to_string(),
                        details: None,
                    }),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();

        // Terminal states are final
        assert!(registry
            .transition(
                &job.id,
                JobState::Completed,
                TransitionPatch {
                    result: Some(completed_result()),
                    ..TransitionPatch::default()
                },
            )
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let registry = test_registry();
        let job = registry.create(JobKind::Upscale, test_input());
        assert!(registry.delete(&job.id));
        assert!(!registry.delete(&job.id));
        assert!(registry.get(&job.id).is_none());
    }

    #[tokio::test]
    async fn test_cleanup_terminal_only_removes_finished() {
        let registry = test_registry();
        let pending = registry.create(JobKind::Upscale, test_input());
        let done = registry.create(JobKind::Upscale, test_input());
        registry
            .transition(
                &done.id,
                JobState::Processing,
                TransitionPatch {
                    assigned_worker: Some("w1".to_string()),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();
        registry
            .transition(
                &done.id,
                JobState::Completed,
                TransitionPatch {
                    result: Some(completed_result()),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();

        assert_eq!(registry.cleanup_terminal(), 1);
        assert_eq!(registry.cleanup_terminal(), 0);
        assert!(registry.get(&pending.id).is_some());
        assert!(registry.get(&done.id).is_none());
    }

    #[tokio::test]
    async fn test_terminal_retention_evicts() {
        let registry = Arc::new(JobRegistry::new(
            Duration::from_secs(300),
            Duration::from_millis(50),
        ));
        let job = registry.create(JobKind::Upscale, test_input());
        registry
            .transition(
                &job.id,
                JobState::Processing,
                TransitionPatch {
                    assigned_worker: Some("w1".to_string()),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();
        registry
            .transition(
                &job.id,
                JobState::Completed,
                TransitionPatch {
                    result: Some(completed_result()),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();

        assert!(registry.get(&job.id).is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get(&job.id).is_none());
    }

    #[tokio::test]
    async fn test_pending_list_is_fifo() {
        let registry = test_registry();
        let a = registry.create(JobKind::Upscale, test_input());
        let b = registry.create(JobKind::Upscale, test_input());
        let c = registry.create(JobKind::Upscale, test_input());

        let pending = registry.list_by_state(JobState::Pending);
        let ids: Vec<&str> = pending.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let registry = test_registry();
        registry.create(JobKind::Upscale, test_input());
        let j = registry.create(JobKind::RemoveBackground, test_input());
        registry
            .transition(
                &j.id,
                JobState::Processing,
                TransitionPatch {
                    assigned_worker: Some("w1".to_string()),
                    ..TransitionPatch::default()
                },
            )
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.by_kind.get("upscale"), Some(&1));
        assert_eq!(stats.by_worker.get("w1"), Some(&1));
    }
}
