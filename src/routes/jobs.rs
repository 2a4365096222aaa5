//! Job tracking endpoints
//!
//! Status, result retrieval, filtered listing, deletion and cleanup. All
//! payloads are built from registry snapshots; nothing here mutates a job
//! except delete/cleanup.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

use super::{error_response, json_response};
use crate::context::SystemContext;
use crate::jobs::{Job, JobFilter, JobKind, JobState};

/// Common job view for status and list responses
fn job_view(job: &Job) -> serde_json::Value {
    let mut fields = serde_json::Map::new();
    fields.insert("id".to_string(), json!(job.id));
    fields.insert("state".to_string(), json!(job.state.as_str()));
    fields.insert("kind".to_string(), json!(job.kind.as_str()));
    fields.insert("created_time".to_string(), json!(job.created_at.to_rfc3339()));
    fields.insert(
        "updated_time".to_string(),
        json!(job.last_touched_at.to_rfc3339()),
    );
    if let Some(worker) = &job.assigned_worker {
        fields.insert("worker".to_string(), json!(worker));
    }
    if let Some(prompt_id) = &job.prompt_id {
        fields.insert("prompt_id".to_string(), json!(prompt_id));
    }
    if let Some(secs) = job.processing_time_secs() {
        fields.insert("processing_time_seconds".to_string(), json!(secs));
    }
    if let Some(finished) = &job.finished_at {
        fields.insert("finished_time".to_string(), json!(finished.to_rfc3339()));
    }
    if let Some(error) = &job.error {
        fields.insert("error".to_string(), json!(error.message));
        fields.insert(
            "error_details".to_string(),
            json!({
                "kind": error.kind,
                "details": error.details,
            }),
        );
    }
    if job.state == JobState::Completed {
        fields.insert("has_result".to_string(), json!(true));
    }
    serde_json::Value::Object(fields)
}

/// Handle GET /api/jobs/{id}/status
pub fn handle_job_status(ctx: Arc<SystemContext>, id: &str) -> Response<Full<Bytes>> {
    match ctx.jobs.get(id) {
        Some(job) => json_response(StatusCode::OK, &job_view(&job)),
        None => error_response(StatusCode::NOT_FOUND, &format!("Unknown job {id}")),
    }
}

/// Handle GET /api/jobs/{id}/result
pub fn handle_job_result(ctx: Arc<SystemContext>, id: &str) -> Response<Full<Bytes>> {
    let Some(job) = ctx.jobs.get(id) else {
        return error_response(StatusCode::NOT_FOUND, &format!("Unknown job {id}"));
    };

    match (job.state, &job.result) {
        (JobState::Completed, Some(result)) => json_response(
            StatusCode::OK,
            &json!({
                "id": job.id,
                "state": job.state.as_str(),
                "kind": job.kind.as_str(),
                "image": result.image,
                "content_type": result.content_type,
                "filename": result.filename,
                "prompt_id": result.prompt_id,
            }),
        ),
        (JobState::Failed, _) => {
            let message = job
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "Job failed".to_string());
            json_response(
                StatusCode::BAD_GATEWAY,
                &json!({
                    "id": job.id,
                    "state": job.state.as_str(),
                    "error": message,
                    "error_details": job.error.as_ref().map(|e| json!({
                        "kind": e.kind,
                        "details": e.details,
                    })),
                }),
            )
        }
        _ => error_response(
            StatusCode::CONFLICT,
            &format!("Job {id} is {}, result not available", job.state),
        ),
    }
}

/// Handle GET /api/jobs/list?state=&kind=&worker=
pub fn handle_job_list(ctx: Arc<SystemContext>, query: Option<&str>) -> Response<Full<Bytes>> {
    let mut filter = JobFilter::default();
    for (key, value) in parse_query(query) {
        match key.as_str() {
            "state" => match JobState::parse(&value) {
                Some(state) => filter.state = Some(state),
                None => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        &format!("Unknown state '{value}'"),
                    )
                }
            },
            "kind" => match JobKind::parse(&value) {
                Some(kind) => filter.kind = Some(kind),
                None => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        &format!("Unknown kind '{value}'"),
                    )
                }
            },
            "worker" => filter.worker = Some(value),
            _ => {}
        }
    }

    let jobs = ctx.jobs.list(&filter);
    let views: Vec<serde_json::Value> = jobs.iter().map(job_view).collect();
    json_response(
        StatusCode::OK,
        &json!({
            "count": views.len(),
            "jobs": views,
        }),
    )
}

/// Handle DELETE /api/jobs/{id}
pub fn handle_job_delete(ctx: Arc<SystemContext>, id: &str) -> Response<Full<Bytes>> {
    let deleted = ctx.jobs.delete(id);
    json_response(
        StatusCode::OK,
        &json!({
            "id": id,
            "deleted": deleted,
        }),
    )
}

/// Handle POST /api/jobs/cleanup
pub fn handle_job_cleanup(ctx: Arc<SystemContext>) -> Response<Full<Bytes>> {
    let removed = ctx.jobs.cleanup_terminal();
    json_response(StatusCode::OK, &json!({ "removed": removed }))
}

/// Handle GET /api/jobs/stats
pub fn handle_job_stats(ctx: Arc<SystemContext>) -> Response<Full<Bytes>> {
    let stats = ctx.jobs.stats();
    let body = serde_json::to_value(&stats)
        .unwrap_or_else(|_| json!({"error": "serialization failed"}));
    json_response(StatusCode::OK, &body)
}

/// Minimal query-string splitting; values are percent-decoded
pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((key.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let parsed = parse_query(Some("state=pending&worker=10.0.0.1%3A8188&flag"));
        assert_eq!(
            parsed,
            vec![
                ("state".to_string(), "pending".to_string()),
                ("worker".to_string(), "10.0.0.1:8188".to_string()),
            ]
        );
        assert!(parse_query(None).is_empty());
    }
}
