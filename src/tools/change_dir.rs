//! `change_dir` — lets the model move the conversation's working directory
//! without going through a bash `cd` (step h of the turn algorithm treats
//! this the same as a bash-driven cwd change).

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct ChangeDirInput {
    path: String,
}

pub struct ChangeDirTool;

#[async_trait]
impl Tool for ChangeDirTool {
    fn name(&self) -> &str {
        "change_dir"
    }

    fn description(&self) -> String {
        "Changes the conversation's working directory for all subsequent tool calls. \
Accepts an absolute path or a path relative to the current working directory. \
The target must already exist as a directory."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path, or path relative to the current working directory"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: ChangeDirInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let requested = PathBuf::from(&input.path);
        let resolved = if requested.is_absolute() {
            requested
        } else {
            ctx.working_dir.join(requested)
        };

        let canonical = match resolved.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                return ToolOutput::error(format!(
                    "Cannot change to {}: {e}",
                    resolved.display()
                ))
            }
        };

        if !canonical.is_dir() {
            return ToolOutput::error(format!("{} is not a directory", canonical.display()));
        }

        ToolOutput::success(format!("Changed working directory to {}", canonical.display()))
            .with_cwd_change(canonical)
    }
}
