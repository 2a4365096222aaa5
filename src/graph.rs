//! Graph templates and the submission rewriter
//!
//! Graphs are opaque node-dataflow trees sent verbatim to the worker. The
//! core knows exactly two semantic hooks: nodes whose metadata carries the
//! `InputImageBase64` title receive the uploaded image, and `SaveImage`
//! class nodes get a per-submission token appended to their filename
//! prefix so the worker's result cache treats every submission as fresh.

use chrono::Utc;
use serde_json::{json, Value};

use crate::jobs::{JobInput, JobKind, OutputFormat};

/// Node-meta title marking the image input slot
pub const INPUT_IMAGE_SENTINEL: &str = "InputImageBase64";

/// Class-name fragment identifying save nodes
pub const SAVE_IMAGE_CLASS: &str = "SaveImage";

/// Output node the workflow is expected to produce images on, per kind
pub fn target_node(kind: JobKind) -> &'static str {
    match kind {
        JobKind::RemoveBackground => "9",
        JobKind::Upscale => "9",
        JobKind::UpscaleRemoveBg => "9",
    }
}

/// Base template for a pipeline, with format and crop already applied
fn template(kind: JobKind, format: OutputFormat, crop: bool) -> Value {
    match kind {
        JobKind::RemoveBackground => json!({
            "1": {
                "class_type": "ETN_LoadImageBase64",
                "inputs": { "image": "" },
                "_meta": { "title": INPUT_IMAGE_SENTINEL }
            },
            "2": {
                "class_type": "InspyrenetRembg",
                "inputs": {
                    "image": ["1", 0],
                    "torchscript_jit": "default",
                    "crop": crop
                },
                "_meta": { "title": "Remove Background" }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": {
                    "images": ["2", 0],
                    "filename_prefix": "gateway/removebg",
                    "format": format.as_str()
                },
                "_meta": { "title": "Save Output" }
            }
        }),
        JobKind::Upscale => json!({
            "1": {
                "class_type": "ETN_LoadImageBase64",
                "inputs": { "image": "" },
                "_meta": { "title": INPUT_IMAGE_SENTINEL }
            },
            "2": {
                "class_type": "UpscaleModelLoader",
                "inputs": { "model_name": "4x_NMKD-Siax_200k.pth" },
                "_meta": { "title": "Load Upscale Model" }
            },
            "3": {
                "class_type": "ImageUpscaleWithModel",
                "inputs": {
                    "upscale_model": ["2", 0],
                    "image": ["1", 0]
                },
                "_meta": { "title": "Upscale" }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": {
                    "images": ["3", 0],
                    "filename_prefix": "gateway/upscale",
                    "format": format.as_str()
                },
                "_meta": { "title": "Save Output" }
            }
        }),
        JobKind::UpscaleRemoveBg => json!({
            "1": {
                "class_type": "ETN_LoadImageBase64",
                "inputs": { "image": "" },
                "_meta": { "title": INPUT_IMAGE_SENTINEL }
            },
            "2": {
                "class_type": "UpscaleModelLoader",
                "inputs": { "model_name": "4x_NMKD-Siax_200k.pth" },
                "_meta": { "title": "Load Upscale Model" }
            },
            "3": {
                "class_type": "ImageUpscaleWithModel",
                "inputs": {
                    "upscale_model": ["2", 0],
                    "image": ["1", 0]
                },
                "_meta": { "title": "Upscale" }
            },
            "4": {
                "class_type": "InspyrenetRembg",
                "inputs": {
                    "image": ["3", 0],
                    "torchscript_jit": "default",
                    "crop": crop
                },
                "_meta": { "title": "Remove Background" }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": {
                    "images": ["4", 0],
                    "filename_prefix": "gateway/upscale-removebg",
                    "format": format.as_str()
                },
                "_meta": { "title": "Save Output" }
            }
        }),
    }
}

/// Strip a `data:image/...;base64,` prefix if the client sent one
pub fn strip_data_url_prefix(image: &str) -> &str {
    match image.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => image,
    }
}

/// Per-submission uniqueness token. Injected into save nodes so the
/// upstream graph-level cache never replays a previous result.
pub fn submission_token(job_id: &str) -> String {
    format!("job_{job_id}_{}", Utc::now().timestamp_millis())
}

/// Build the graph for one submission: instantiate the template, write the
/// image into every sentinel node, and tag every save node with the token.
pub fn prepare_graph(kind: JobKind, input: &JobInput, token: &str) -> Value {
    let mut graph = template(kind, input.format, input.crop);
    inject_input_image(&mut graph, strip_data_url_prefix(&input.image_base64));
    tag_save_nodes(&mut graph, token);
    graph
}

/// Write the image payload into every node titled with the input sentinel
fn inject_input_image(graph: &mut Value, image_base64: &str) {
    let Some(nodes) = graph.as_object_mut() else {
        return;
    };
    for node in nodes.values_mut() {
        let is_input = node
            .pointer("/_meta/title")
            .and_then(|t| t.as_str())
            .is_some_and(|t| t == INPUT_IMAGE_SENTINEL);
        if is_input {
            if let Some(inputs) = node.get_mut("inputs") {
                inputs["image"] = Value::String(image_base64.to_string());
            }
        }
    }
}

/// Suffix the filename prefix of every save node with the token
fn tag_save_nodes(graph: &mut Value, token: &str) {
    let Some(nodes) = graph.as_object_mut() else {
        return;
    };
    for node in nodes.values_mut() {
        let is_save = node
            .get("class_type")
            .and_then(|c| c.as_str())
            .is_some_and(|c| c.contains(SAVE_IMAGE_CLASS));
        if is_save {
            if let Some(inputs) = node.get_mut("inputs") {
                let prefix = inputs
                    .get("filename_prefix")
                    .and_then(|p| p.as_str())
                    .unwrap_or("gateway");
                inputs["filename_prefix"] = Value::String(format!("{prefix}_{token}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_input() -> JobInput {
        JobInput {
            image_base64: "data:image/png;base64,aGVsbG8=".to_string(),
            format: OutputFormat::Png,
            crop: false,
        }
    }

    #[test]
    fn test_strip_data_url_prefix() {
        assert_eq!(
            strip_data_url_prefix("data:image/png;base64,aGVsbG8="),
            "aGVsbG8="
        );
        assert_eq!(strip_data_url_prefix("aGVsbG8="), "aGVsbG8=");
    }

    #[test]
    fn test_image_injected_into_sentinel_only() {
        let graph = prepare_graph(JobKind::RemoveBackground, &test_input(), "job_x_1");

        assert_eq!(
            graph.pointer("/1/inputs/image").unwrap().as_str().unwrap(),
            "aGVsbG8="
        );
        // The rembg node's image input is a link, not the payload
        assert!(graph.pointer("/2/inputs/image").unwrap().is_array());
    }

    #[test]
    fn test_save_nodes_get_unique_suffix() {
        let graph = prepare_graph(JobKind::Upscale, &test_input(), "job_abc_42");
        let prefix = graph
            .pointer("/9/inputs/filename_prefix")
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(prefix, "gateway/upscale_job_abc_42");
    }

    #[test]
    fn test_tokens_differ_per_job() {
        assert_ne!(submission_token("a"), submission_token("b"));
    }

    #[test]
    fn test_crop_and_format_applied() {
        let input = JobInput {
            image_base64: "aGVsbG8=".to_string(),
            format: OutputFormat::Webp,
            crop: true,
        };
        let graph = prepare_graph(JobKind::UpscaleRemoveBg, &input, "t");
        assert_eq!(
            graph.pointer("/4/inputs/crop").unwrap().as_bool().unwrap(),
            true
        );
        assert_eq!(
            graph.pointer("/9/inputs/format").unwrap().as_str().unwrap(),
            "WEBP"
        );
    }

    #[test]
    fn test_every_kind_has_images_on_target_node() {
        for kind in [
            JobKind::RemoveBackground,
            JobKind::Upscale,
            JobKind::UpscaleRemoveBg,
        ] {
            let graph = prepare_graph(kind, &test_input(), "t");
            let target = target_node(kind);
            assert!(
                graph.get(target).is_some(),
                "missing target node for {kind}"
            );
            let class = graph
                .pointer(&format!("/{target}/class_type"))
                .unwrap()
                .as_str()
                .unwrap();
            assert!(class.contains(SAVE_IMAGE_CLASS));
        }
    }
}
