//! REST client for the worker HTTP endpoints
//!
//! Covers the three request/response endpoints of the worker contract:
//! `POST /prompt`, `GET /history/<id>` and `GET /view`. Every call carries
//! an explicit deadline; transport failures map to the transport error
//! class so the caller can mark the worker unhealthy.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::types::{GatewayError, Result};
use crate::workers::Worker;

/// Response from `POST /prompt`
#[derive(Debug, Clone, Deserialize)]
pub struct PromptResponse {
    pub prompt_id: String,
    #[serde(default)]
    pub number: i64,
}

/// Location of one output image on the worker
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Shared HTTP client for all workers
pub struct ComfyClient {
    client: reqwest::Client,
}

impl Default for ComfyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ComfyClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Enqueue a graph on the worker. A non-empty `node_errors` mapping in
    /// the response is a validation failure, not a worker fault.
    pub async fn submit_prompt(
        &self,
        worker: &Worker,
        graph: &Value,
        client_id: &str,
        timeout: Duration,
    ) -> Result<PromptResponse> {
        let url = format!("{}/prompt", worker.base_url);
        let body = serde_json::json!({
            "prompt": graph,
            "client_id": client_id,
        });

        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let payload: Value = resp.json().await.map_err(|e| {
            GatewayError::Transport(format!("Malformed prompt response from {}: {e}", worker.id))
        })?;

        if let Some(node_errors) = payload.get("node_errors") {
            if node_errors.as_object().is_some_and(|m| !m.is_empty()) {
                return Err(GatewayError::Validation(format!(
                    "Worker rejected graph nodes: {node_errors}"
                )));
            }
        }

        if status.is_client_error() {
            return Err(GatewayError::Validation(format!(
                "Worker {} rejected submission: {payload}",
                worker.id
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Transport(format!(
                "Worker {} returned {status} on submit",
                worker.id
            )));
        }

        let parsed: PromptResponse = serde_json::from_value(payload).map_err(|e| {
            GatewayError::Transport(format!("Missing prompt_id from {}: {e}", worker.id))
        })?;

        debug!(worker = %worker.id, prompt_id = %parsed.prompt_id, "Graph submitted");
        Ok(parsed)
    }

    /// Fetch the history entry for a finished submission
    pub async fn fetch_history(
        &self,
        worker: &Worker,
        prompt_id: &str,
        timeout: Duration,
    ) -> Result<Value> {
        let url = format!("{}/history/{prompt_id}", worker.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GatewayError::DownloadFailure(format!("History fetch failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(GatewayError::DownloadFailure(format!(
                "Worker {} returned {} for history {prompt_id}",
                worker.id,
                resp.status()
            )));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| GatewayError::DownloadFailure(format!("Malformed history entry: {e}")))
    }

    /// Download the image bytes behind a history entry. Returns the raw
    /// bytes and the content type reported by the worker.
    pub async fn download_view(
        &self,
        worker: &Worker,
        image: &ImageRef,
        timeout: Duration,
    ) -> Result<(Vec<u8>, String)> {
        let url = format!(
            "{}/view?filename={}&subfolder={}&type={}",
            worker.base_url,
            urlencoding::encode(&image.filename),
            urlencoding::encode(&image.subfolder),
            urlencoding::encode(&image.kind),
        );

        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GatewayError::DownloadFailure(format!("View download failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(GatewayError::DownloadFailure(format!(
                "Worker {} returned {} for {}",
                worker.id,
                resp.status(),
                image.filename
            )));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::DownloadFailure(format!("View body read failed: {e}")))?;

        Ok((bytes.to_vec(), content_type))
    }
}

/// Pick the output image from a history payload. Prefers the
/// workflow-defined target node; falls back to the first node that
/// produced any image.
pub fn pick_output_image(
    history: &Value,
    prompt_id: &str,
    target_node: &str,
) -> Result<ImageRef> {
    let outputs = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(|o| o.as_object())
        .ok_or_else(|| {
            GatewayError::MissingOutput(format!("No outputs in history for {prompt_id}"))
        })?;

    let first_image = |node: &Value| -> Option<ImageRef> {
        node.get("images")
            .and_then(|imgs| imgs.as_array())
            .and_then(|imgs| imgs.first())
            .and_then(|img| serde_json::from_value(img.clone()).ok())
    };

    if let Some(node) = outputs.get(target_node) {
        if let Some(image) = first_image(node) {
            return Ok(image);
        }
    }

    outputs
        .values()
        .find_map(first_image)
        .ok_or_else(|| GatewayError::MissingOutput(format!("No images produced for {prompt_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_history() -> Value {
        json!({
            "abc": {
                "outputs": {
                    "7": { "text": ["meta"] },
                    "9": {
                        "images": [
                            { "filename": "out_00001.png", "subfolder": "", "type": "output" }
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn test_pick_target_node() {
        let image = pick_output_image(&sample_history(), "abc", "9").unwrap();
        assert_eq!(image.filename, "out_00001.png");
        assert_eq!(image.kind, "output");
    }

    #[test]
    fn test_fallback_to_first_node_with_images() {
        // Target node has no images; the only image-bearing node wins
        let image = pick_output_image(&sample_history(), "abc", "7").unwrap();
        assert_eq!(image.filename, "out_00001.png");
    }

    #[test]
    fn test_missing_prompt_entry() {
        let err = pick_output_image(&sample_history(), "missing", "9").unwrap_err();
        assert_eq!(err.kind(), "missing-output");
    }

    #[test]
    fn test_no_images_anywhere() {
        let history = json!({
            "abc": { "outputs": { "7": { "text": ["meta"] } } }
        });
        let err = pick_output_image(&history, "abc", "9").unwrap_err();
        assert_eq!(err.kind(), "missing-output");
    }
}
