//! Job model for the processing pipeline
//!
//! A job is created by a request handler, mutated only through the
//! [`registry::JobRegistry`], and evicted by cleanup timers after a
//! terminal-state grace window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod registry;

pub use registry::{JobFilter, JobRegistry, JobStats, TransitionPatch};

/// Processing pipeline selected by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    RemoveBackground,
    Upscale,
    UpscaleRemoveBg,
}

impl JobKind {
    /// Canonical name used in URLs, payloads and metrics keys
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RemoveBackground => "remove-background",
            JobKind::Upscale => "upscale",
            JobKind::UpscaleRemoveBg => "upscale-remove-bg",
        }
    }

    /// Parse a kind from a URL segment or query value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "remove-background" | "remove-bg" => Some(JobKind::RemoveBackground),
            "upscale" | "upscale-image" => Some(JobKind::Upscale),
            "upscale-remove-bg" | "upscale-remove-background" => Some(JobKind::UpscaleRemoveBg),
            _ => None,
        }
    }

    /// Whether the crop option applies to this pipeline
    pub fn supports_crop(&self) -> bool {
        matches!(self, JobKind::RemoveBackground | JobKind::UpscaleRemoveBg)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output image format requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "PNG")]
    Png,
    #[serde(rename = "JPEG")]
    Jpeg,
    #[serde(rename = "WEBP")]
    Webp,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "PNG",
            OutputFormat::Jpeg => "JPEG",
            OutputFormat::Webp => "WEBP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PNG" => Some(OutputFormat::Png),
            "JPEG" | "JPG" => Some(OutputFormat::Jpeg),
            "WEBP" => Some(OutputFormat::Webp),
            _ => None,
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Png
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Legal forward transitions: pending -> processing -> {completed, failed}
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Processing)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable job input captured at creation
#[derive(Debug, Clone)]
pub struct JobInput {
    /// Raw base64 image payload (no data-URL prefix)
    pub image_base64: String,
    /// Requested output format
    pub format: OutputFormat,
    /// Crop-to-subject flag, honored where the pipeline supports it
    pub crop: bool,
}

/// Completed job payload
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    /// Result image re-wrapped as a data URL
    pub image: String,
    /// Content type reported by the worker
    pub content_type: String,
    /// Output filename on the worker
    pub filename: String,
    /// Upstream submission id the result came from
    pub prompt_id: String,
}

/// Failed job payload
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    /// Machine-readable error kind (see error taxonomy)
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Optional structured details (e.g. upstream node errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// A tracked job. Snapshots returned by the registry are defensive copies.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub input: JobInput,
    pub created_at: DateTime<Utc>,
    /// Monotonic creation sequence, used for stable FIFO dispatch ordering
    pub seq: u64,
    pub state: JobState,
    pub assigned_worker: Option<String>,
    pub prompt_id: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<JobFailure>,
    pub last_touched_at: DateTime<Utc>,
}

impl Job {
    /// Seconds spent processing so far (or total, once finished)
    pub fn processing_time_secs(&self) -> Option<f64> {
        let start = self.processing_started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            JobKind::RemoveBackground,
            JobKind::Upscale,
            JobKind::UpscaleRemoveBg,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("upscale-image"), Some(JobKind::Upscale));
        assert_eq!(JobKind::parse("remove-bg"), Some(JobKind::RemoveBackground));
        assert_eq!(JobKind::parse("sharpen"), None);
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(OutputFormat::parse("png"), Some(OutputFormat::Png));
        assert_eq!(OutputFormat::parse("JPG"), Some(OutputFormat::Jpeg));
        assert_eq!(OutputFormat::parse("webp"), Some(OutputFormat::Webp));
        assert_eq!(OutputFormat::parse("tiff"), None);
        assert_eq!(OutputFormat::default(), OutputFormat::Png);
    }

    #[test]
    fn test_legal_transitions() {
        assert!(JobState::Pending.can_transition_to(JobState::Processing));
        assert!(JobState::Processing.can_transition_to(JobState::Completed));
        assert!(JobState::Processing.can_transition_to(JobState::Failed));

        // No backward or skipping transitions
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
        assert!(!JobState::Pending.can_transition_to(JobState::Failed));
        assert!(!JobState::Processing.can_transition_to(JobState::Pending));
        assert!(!JobState::Completed.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::Processing));
    }

    #[test]
    fn test_crop_support() {
        assert!(JobKind::RemoveBackground.supports_crop());
        assert!(JobKind::UpscaleRemoveBg.supports_crop());
        assert!(!JobKind::Upscale.supports_crop());
    }
}
