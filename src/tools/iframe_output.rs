//! `iframe_output` — hands the UI a local file (an HTML report, a rendered
//! diagram, a build artifact) to display inline in a sandboxed iframe,
//! rather than describing it in text.

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Cap the embedded content so a large artifact doesn't blow out message
/// storage; point the user at the file directly past this size.
const MAX_INLINE_SIZE: u64 = 2 * 1024 * 1024; // 2MB

#[derive(Debug, Deserialize)]
struct IframeOutputInput {
    path: String,
    #[serde(default)]
    title: Option<String>,
}

pub struct IframeOutputTool;

impl IframeOutputTool {
    fn resolve_path(ctx: &ToolContext, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            ctx.working_dir.join(path)
        }
    }
}

#[async_trait]
impl Tool for IframeOutputTool {
    fn name(&self) -> &str {
        "iframe_output"
    }

    fn description(&self) -> String {
        "Displays a local HTML file (or other browser-renderable file) inline in the UI as a \
sandboxed iframe, instead of describing it in text. Use for generated reports, rendered \
diagrams, or other visual artifacts you've written to a file. Give it a short `title` for \
the panel heading."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to display, absolute or relative to the working directory"
                },
                "title": {
                    "type": "string",
                    "description": "Short heading for the iframe panel"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: IframeOutputInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let path = Self::resolve_path(&ctx, &input.path);

        if !path.is_file() {
            return ToolOutput::error(format!("Not a file: {}", path.display()));
        }

        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => return ToolOutput::error(format!("Cannot read file: {e}")),
        };

        if metadata.len() > MAX_INLINE_SIZE {
            return ToolOutput::error(format!(
                "{} is too large to display inline ({} bytes, max {} bytes)",
                path.display(),
                metadata.len(),
                MAX_INLINE_SIZE
            ));
        }

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("Failed to read file: {e}")),
        };

        let title = input.title.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "output".to_string())
        });

        let display_data = json!({
            "title": title,
            "path": path.display().to_string(),
            "content": content,
        });

        ToolOutput::success(format!("Displaying {} as \"{title}\"", path.display()))
            .with_display(display_data)
    }
}
