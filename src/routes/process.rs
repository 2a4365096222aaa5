//! Image processing endpoints
//!
//! Accepts a multipart upload (`imageFile` field, optional `format` and
//! `crop`), creates a job, and either waits for the terminal state
//! (synchronous mode) or immediately returns the job id (async mode,
//! selected with `async=true`, `mode=async` or the /api/async/ prefix).

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyDataStream, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use super::jobs::parse_query;
use super::{error_response, json_response};
use crate::context::SystemContext;
use crate::jobs::{Job, JobInput, JobKind, JobState, OutputFormat};

/// How often the synchronous path re-checks the registry
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Parsed upload form
struct ProcessRequest {
    image: Bytes,
    format: OutputFormat,
    crop: bool,
    async_mode: bool,
}

/// Handle POST /api/remove-background, /api/upscale-image,
/// /api/upscale-remove-bg and /api/async/{kind}
pub async fn handle_process(
    req: Request<Incoming>,
    ctx: Arc<SystemContext>,
    kind: JobKind,
    force_async: bool,
) -> Response<Full<Bytes>> {
    let parsed = match parse_process_request(req).await {
        Ok(parsed) => parsed,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    let input = JobInput {
        image_base64: base64::engine::general_purpose::STANDARD.encode(&parsed.image),
        format: parsed.format,
        crop: parsed.crop && kind.supports_crop(),
    };

    let job = ctx.jobs.create(kind, input);
    ctx.metrics.record_created(kind);
    debug!(
        job_id = %job.id,
        kind = %kind,
        bytes = parsed.image.len(),
        async_mode = parsed.async_mode || force_async,
        "Processing request accepted"
    );

    if parsed.async_mode || force_async {
        return json_response(
            StatusCode::ACCEPTED,
            &json!({
                "id": job.id,
                "state": job.state.as_str(),
                "kind": kind.as_str(),
                "created_time": job.created_at.to_rfc3339(),
            }),
        );
    }

    wait_for_completion(&ctx, &job.id).await
}

/// Poll the registry until the job reaches a terminal state or its
/// deadline passes, then shape the response.
async fn wait_for_completion(ctx: &Arc<SystemContext>, job_id: &str) -> Response<Full<Bytes>> {
    let deadline = tokio::time::Instant::now() + ctx.args.job_timeout();

    loop {
        let Some(job) = ctx.jobs.get(job_id) else {
            // Evicted while we waited
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                &format!("Job {job_id} timed out and was evicted"),
            );
        };

        match job.state {
            JobState::Completed => return completed_response(&job),
            JobState::Failed => return failed_response(&job),
            _ => {}
        }

        if tokio::time::Instant::now() >= deadline {
            warn!(job_id = %job_id, "Synchronous request exceeded job timeout");
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                &format!("Job {job_id} did not finish in time"),
            );
        }
        tokio::time::sleep(SYNC_POLL_INTERVAL).await;
    }
}

fn completed_response(job: &Job) -> Response<Full<Bytes>> {
    let Some(result) = &job.result else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Completed job lost result");
    };
    json_response(
        StatusCode::OK,
        &json!({
            "id": job.id,
            "state": job.state.as_str(),
            "kind": job.kind.as_str(),
            "image": result.image,
            "content_type": result.content_type,
            "filename": result.filename,
            "prompt_id": result.prompt_id,
            "processing_time_seconds": job.processing_time_secs(),
        }),
    )
}

fn failed_response(job: &Job) -> Response<Full<Bytes>> {
    let (kind, message) = job
        .error
        .as_ref()
        .map(|e| (e.kind.as_str(), e.message.clone()))
        .unwrap_or(("internal", "Job failed".to_string()));

    let status = match kind {
        "validation" => StatusCode::BAD_REQUEST,
        "breaker-open" => StatusCode::SERVICE_UNAVAILABLE,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };

    json_response(
        status,
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

/// Pull the upload and options out of the request. Query parameters are
/// read first; form fields of the same name win.
async fn parse_process_request(req: Request<Incoming>) -> Result<ProcessRequest, String> {
    let query = req.uri().query().map(|q| q.to_string());
    let mut format: Option<OutputFormat> = None;
    let mut crop = false;
    let mut async_mode = false;

    for (key, value) in parse_query(query.as_deref()) {
        apply_option(&key, &value, &mut format, &mut crop, &mut async_mode)?;
    }

    let boundary = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or_else(|| "Expected multipart/form-data with a boundary".to_string())?;

    let stream = BodyDataStream::new(req.into_body());
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut image: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("Malformed multipart body: {e}"))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "imageFile" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| format!("Failed to read imageFile: {e}"))?;
                image = Some(bytes);
            }
            other => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| format!("Failed to read field {other}: {e}"))?;
                apply_option(other, &value, &mut format, &mut crop, &mut async_mode)?;
            }
        }
    }

    let image = image.ok_or_else(|| "Missing required field 'imageFile'".to_string())?;
    if image.is_empty() {
        return Err("Uploaded imageFile is empty".to_string());
    }

    Ok(ProcessRequest {
        image,
        format: format.unwrap_or_default(),
        crop,
        async_mode,
    })
}

/// Interpret one option from the query string or the form
fn apply_option(
    key: &str,
    value: &str,
    format: &mut Option<OutputFormat>,
    crop: &mut bool,
    async_mode: &mut bool,
) -> Result<(), String> {
    match key {
        "format" => {
            *format = Some(
                OutputFormat::parse(value)
                    .ok_or_else(|| format!("Unsupported format '{value}' (PNG, JPEG, WEBP)"))?,
            );
        }
        "crop" => *crop = matches!(value, "true" | "1" | "yes"),
        "async" => *async_mode = matches!(value, "true" | "1" | "yes"),
        "mode" => *async_mode = value == "async",
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_option_format() {
        let mut format = None;
        let mut crop = false;
        let mut async_mode = false;

        apply_option("format", "webp", &mut format, &mut crop, &mut async_mode).unwrap();
        assert_eq!(format, Some(OutputFormat::Webp));

        assert!(apply_option("format", "bmp", &mut format, &mut crop, &mut async_mode).is_err());
    }

    #[test]
    fn test_apply_option_async_variants() {
        let mut format = None;
        let mut crop = false;
        let mut async_mode = false;

        apply_option("async", "true", &mut format, &mut crop, &mut async_mode).unwrap();
        assert!(async_mode);

        async_mode = false;
        apply_option("mode", "async", &mut format, &mut crop, &mut async_mode).unwrap();
        assert!(async_mode);

        async_mode = false;
        apply_option("mode", "sync", &mut format, &mut crop, &mut async_mode).unwrap();
        assert!(!async_mode);
    }

    #[test]
    fn test_apply_option_crop() {
        let mut format = None;
        let mut crop = false;
        let mut async_mode = false;

        apply_option("crop", "1", &mut format, &mut crop, &mut async_mode).unwrap();
        assert!(crop);
        apply_option("crop", "false", &mut format, &mut crop, &mut async_mode).unwrap();
        assert!(!crop);
    }
}
