//! Read image tool - allows LLM to examine images in the workspace
//!
//! REQ-TOOL: `read_image` for viewing screenshots, diagrams, etc.

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Maximum image size (5MB)
const MAX_IMAGE_SIZE: u64 = 5 * 1024 * 1024;

/// Supported image formats and their media types
const SUPPORTED_FORMATS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

/// Read image tool for examining images in the workspace
///
/// REQ-BASH-010: Stateless - uses `ToolContext` for `working_dir`
pub struct ReadImageTool;

impl ReadImageTool {
    fn resolve_path(ctx: &ToolContext, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            ctx.working_dir.join(path)
        }
    }

    fn get_media_type(path: &Path) -> Option<&'static str> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        SUPPORTED_FORMATS
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, media_type)| *media_type)
    }
}

#[derive(Debug, Deserialize)]
struct ReadImageInput {
    path: String,
    #[serde(default)]
    #[allow(dead_code)] // Part of schema, parsed but not used
    timeout: Option<String>,
}

#[async_trait]
impl Tool for ReadImageTool {
    fn name(&self) -> &'static str {
        "read_image"
    }

    fn description(&self) -> String {
        "View an image file (PNG, JPG, etc.). Required after browser_take_screenshot to see the screenshot content — the screenshot is saved to a temp file but not automatically visible until you call read_image on that path. Also use for any image file in the working directory.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the image file to read"
                },
                "timeout": {
                    "type": "string",
                    "description": "Timeout duration (default: 15s). Examples: '5s', '1m', '500ms'"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: ReadImageInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let path = Self::resolve_path(&ctx, &input.path);

        // Check file exists
        if !path.exists() {
            return ToolOutput::error(format!("File not found: {}", path.display()));
        }

        // Check it's a file
        if !path.is_file() {
            return ToolOutput::error(format!("Not a file: {}", path.display()));
        }

        // Check format is supported
        let Some(media_type) = Self::get_media_type(&path) else {
            let supported: Vec<_> = SUPPORTED_FORMATS.iter().map(|(e, _)| *e).collect();
            return ToolOutput::error(format!(
                "Unsupported image format. Supported: {}",
                supported.join(", ")
            ));
        };

        // Check file size
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => return ToolOutput::error(format!("Cannot read file: {e}")),
        };

        if metadata.len() > MAX_IMAGE_SIZE {
            return ToolOutput::error(format!(
                "Image too large: {} bytes (max {} bytes)",
                metadata.len(),
                MAX_IMAGE_SIZE
            ));
        }

        // Read and encode
        let data = match fs::read(&path).await {
            Ok(d) => d,
            Err(e) => return ToolOutput::error(format!("Failed to read file: {e}")),
        };

        let max_dim = ctx.max_image_dimension();
        let (data, resized) = match super::image_util::resize_to_fit(&data, media_type, max_dim) {
            Some(smaller) => (smaller, true),
            None => (data, false),
        };
        let base64_data = BASE64.encode(&data);

        // Return structured output for the LLM
        let mut output = json!({
            "type": "image",
            "media_type": media_type,
            "data": base64_data,
        });
        if resized {
            output["description"] = json!("[resized]");
        }

        ToolOutput::success(output.to_string())
    }
}
