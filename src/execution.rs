//! Per-job execution protocol
//!
//! Given a job and a selected worker: rewrite the graph template, submit it
//! over the worker's prompt endpoint using the client token of a pooled
//! stream, watch that stream for a completion or error signal, then fetch
//! the history entry and download the produced image. The final commit
//! transitions the job and updates metrics; the caller handles worker
//! counter bookkeeping.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use tracing::{debug, info, warn};

use crate::context::SystemContext;
use crate::graph;
use crate::health::CircuitBreaker;
use crate::jobs::{Job, JobFailure, JobResult, JobState, TransitionPatch};
use crate::types::{GatewayError, Result};
use crate::upstream::{pick_output_image, PooledStream, StreamEvent};
use crate::workers::Worker;

/// Drive one job to a terminal state. The submit-class breaker admission
/// obtained by the scheduler is settled here exactly once.
pub async fn execute_job(
    ctx: &Arc<SystemContext>,
    job: Job,
    worker: Arc<Worker>,
    breaker: Arc<CircuitBreaker>,
) {
    let started = Instant::now();
    let outcome = run_protocol(ctx, &job, &worker, &breaker).await;

    match outcome {
        Ok(result) => {
            let prompt_id = result.prompt_id.clone();
            ctx.metrics
                .record_completed(job.kind, &worker.id, started.elapsed());
            if let Err(e) = ctx.jobs.transition(
                &job.id,
                JobState::Completed,
                TransitionPatch {
                    result: Some(result),
                    prompt_id: Some(prompt_id),
                    ..TransitionPatch::default()
                },
            ) {
                // Job was evicted mid-flight; nothing left to commit to
                warn!(job_id = %job.id, "Could not commit completed job: {e}");
            } else {
                info!(
                    job_id = %job.id,
                    worker = %worker.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
            }
        }
        Err(e) => {
            if e.marks_worker_unhealthy() {
                ctx.health.mark_unhealthy(&worker, e.kind());
            }
            ctx.metrics
                .record_failed(job.kind, Some(&worker.id), e.kind(), &e.to_string());

            let details = match &e {
                GatewayError::Validation(msg) => {
                    serde_json::from_str(msg.trim_start_matches("Worker rejected graph nodes: "))
                        .ok()
                }
                _ => None,
            };
            if let Err(commit_err) = ctx.jobs.transition(
                &job.id,
                JobState::Failed,
                TransitionPatch {
                    error: Some(JobFailure {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        details,
                    }),
                    ..TransitionPatch::default()
                },
            ) {
                warn!(job_id = %job.id, "Could not commit failed job: {commit_err}");
            } else {
                warn!(
                    job_id = %job.id,
                    worker = %worker.id,
                    error_kind = e.kind(),
                    "Job failed: {e}"
                );
            }
        }
    }
}

/// The protocol proper: acquire stream, submit, monitor, retrieve
async fn run_protocol(
    ctx: &Arc<SystemContext>,
    job: &Job,
    worker: &Arc<Worker>,
    breaker: &CircuitBreaker,
) -> Result<JobResult> {
    let token = graph::submission_token(&job.id);
    let prompt_graph = graph::prepare_graph(job.kind, &job.input, &token);

    let pool = ctx.pools.get(&worker.id).ok_or_else(|| {
        GatewayError::Internal(format!("No stream pool for worker {}", worker.id))
    })?;

    // The execution deadline runs from stream acquisition
    let mut lent = match pool.acquire().await {
        Ok(lent) => lent,
        Err(e) => {
            breaker.record_failure();
            return Err(e);
        }
    };
    let deadline = Instant::now() + ctx.args.execution_timeout();

    let prompt_id =
        match submit_and_monitor(ctx, job, worker, breaker, &mut lent, &prompt_graph, deadline)
            .await
        {
            Ok(prompt_id) => {
                pool.release(lent);
                prompt_id
            }
            Err(e) => {
                pool.release(lent);
                return Err(e);
            }
        };

    // Give the worker a moment to flush outputs to disk
    tokio::time::sleep(ctx.args.settle_delay()).await;

    let history = ctx
        .client
        .fetch_history(worker, &prompt_id, breaker.call_timeout())
        .await?;
    let image_ref = pick_output_image(&history, &prompt_id, graph::target_node(job.kind))?;

    let (bytes, content_type) = ctx
        .client
        .download_view(worker, &image_ref, breaker.call_timeout())
        .await?;

    if ctx.args.output_files {
        write_output_file(&ctx.args.output_dir, &prompt_id, &image_ref.filename, &bytes).await;
    }

    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(JobResult {
        image: format!("data:{content_type};base64,{encoded}"),
        content_type,
        filename: image_ref.filename,
        prompt_id,
    })
}

/// Submit the graph with the stream's client token, then interpret stream
/// events until a completion or error signal, bounded by the deadline.
async fn submit_and_monitor(
    ctx: &Arc<SystemContext>,
    job: &Job,
    worker: &Arc<Worker>,
    breaker: &CircuitBreaker,
    lent: &mut PooledStream,
    prompt_graph: &serde_json::Value,
    deadline: Instant,
) -> Result<String> {
    let submitted = ctx
        .client
        .submit_prompt(worker, prompt_graph, lent.client_id(), breaker.call_timeout())
        .await;

    let prompt_id = match submitted {
        Ok(resp) => {
            // The call reached the worker; validation failures below do not
            // count against it either.
            breaker.record_success();
            resp.prompt_id
        }
        Err(e) => {
            if matches!(e, GatewayError::Transport(_) | GatewayError::Timeout(_)) {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
            return Err(e);
        }
    };
    ctx.jobs.set_prompt_id(&job.id, &prompt_id);

    let mut will_be_cached: HashSet<String> = HashSet::new();
    let mut processing: HashSet<String> = HashSet::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GatewayError::Timeout(format!(
                "No completion signal for {prompt_id} within {:?}",
                ctx.args.execution_timeout()
            )));
        }

        let event = match tokio::time::timeout(remaining, lent.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                return Err(GatewayError::Transport(format!(
                    "Stream to {} closed while monitoring {prompt_id}",
                    worker.id
                )));
            }
            Err(_) => {
                return Err(GatewayError::Timeout(format!(
                    "No completion signal for {prompt_id} within {:?}",
                    ctx.args.execution_timeout()
                )));
            }
        };

        match event {
            StreamEvent::ExecutionCached { prompt_id: p, nodes } if p == prompt_id => {
                will_be_cached.extend(nodes);
            }
            StreamEvent::Executing {
                prompt_id: Some(p),
                node,
            } if p == prompt_id => match node {
                Some(node) => {
                    processing.insert(node);
                }
                None => {
                    debug!(
                        job_id = %job.id,
                        prompt_id = %prompt_id,
                        executed = processing.len(),
                        cached = will_be_cached.len(),
                        "Completion signalled by executing event"
                    );
                    return Ok(prompt_id);
                }
            },
            StreamEvent::ExecutionError { prompt_id: p, message } if p == prompt_id => {
                return Err(GatewayError::UpstreamExecution(message));
            }
            StreamEvent::Status {
                queue_remaining: Some(0),
            } => {
                // Empty queue with no per-node events: completed from cache
                debug!(
                    job_id = %job.id,
                    prompt_id = %prompt_id,
                    executed = processing.len(),
                    cached = will_be_cached.len(),
                    "Completion inferred from empty queue"
                );
                return Ok(prompt_id);
            }
            // Messages for other submissions and informational events
            _ => {}
        }
    }
}

/// Best-effort disk sink; failures are logged, never surfaced
async fn write_output_file(output_dir: &str, prompt_id: &str, filename: &str, bytes: &[u8]) {
    let dir: PathBuf = [output_dir, prompt_id].iter().collect();
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(dir = %dir.display(), "Could not create output directory: {e}");
        return;
    }
    let path = dir.join(filename);
    match tokio::fs::write(&path, bytes).await {
        Ok(()) => debug!(path = %path.display(), "Result image written"),
        Err(e) => warn!(path = %path.display(), "Could not write result image: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_output_file_creates_directories() {
        let dir = std::env::temp_dir().join(format!("sink-{}", uuid::Uuid::new_v4()));
        let dir_str = dir.to_string_lossy().to_string();

        write_output_file(&dir_str, "abc", "out.png", b"fake-image").await;

        let written = tokio::fs::read(dir.join("abc").join("out.png")).await.unwrap();
        assert_eq!(written, b"fake-image");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
