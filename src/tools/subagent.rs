//! `subagent` — resolve-or-create a child conversation and run it to
//! completion (or launch it in the background), with orchestration living
//! behind [`super::SubagentSpawner`].

use super::{SubagentStatus, Tool, ToolContext, ToolOutput};
use crate::slug;
use crate::state_machine::state::SubagentInput;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const MIN_TIMEOUT_SECONDS: u32 = 1;
const MAX_TIMEOUT_SECONDS: u32 = 300;
const DEFAULT_TIMEOUT_SECONDS: u32 = 60;

pub struct SubagentTool;

#[derive(Debug, Deserialize)]
struct SubagentToolInput {
    slug: String,
    prompt: String,
    #[serde(default)]
    timeout_seconds: Option<u32>,
    #[serde(default)]
    wait: Option<bool>,
}

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        "subagent"
    }

    fn description(&self) -> String {
        "Delegate a focused, self-contained piece of work to a subagent conversation. \
Give it a short `slug` naming the subagent (reused across calls with the same slug to \
resume that subagent) and a `prompt` describing the task. With `wait` true (the default), \
blocks until the subagent finishes or `timeout_seconds` elapses, whichever comes first — \
a timeout does not cancel the subagent, it just stops waiting; call again with the same \
slug to check on it later. With `wait` false, returns immediately and the subagent keeps \
running in the background. The subagent inherits your current model and starts in the \
same working directory.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["slug", "prompt"],
            "properties": {
                "slug": {
                    "type": "string",
                    "description": "Short name identifying this subagent; reuse it to resume the same one"
                },
                "prompt": {
                    "type": "string",
                    "description": "Task description given to the subagent as its first message"
                },
                "timeout_seconds": {
                    "type": "integer",
                    "description": "How long to wait for completion, 1-300 (default 60)"
                },
                "wait": {
                    "type": "boolean",
                    "description": "Block for the result (default true); false spawns and returns immediately"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: SubagentToolInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let sanitized_slug = slug::sanitize(&input.slug);
        if sanitized_slug.is_empty() {
            return ToolOutput::error("slug must contain at least one letter or digit");
        }
        if input.prompt.trim().is_empty() {
            return ToolOutput::error("prompt cannot be empty");
        }

        let timeout_seconds = input
            .timeout_seconds
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
            .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
        let wait = input.wait.unwrap_or(true);

        let spawn_input = SubagentInput {
            slug: sanitized_slug,
            prompt: input.prompt,
            timeout_seconds: Some(timeout_seconds),
            wait: Some(wait),
        };

        match ctx.subagents().spawn(&ctx.conv_ctx, spawn_input).await {
            Ok(outcome) => {
                let mut output = match &outcome.status {
                    SubagentStatus::Completed { text } => {
                        if text.is_empty() {
                            format!("<subagent slug=\"{}\">completed with no output</subagent>", outcome.slug)
                        } else {
                            format!(
                                "<subagent slug=\"{}\">{}</subagent>",
                                outcome.slug, text
                            )
                        }
                    }
                    SubagentStatus::StillWorking => format!(
                        "<subagent slug=\"{}\" status=\"still_working\">timed out after {timeout_seconds}s; \
the subagent keeps running, call again with the same slug to check on it</subagent>",
                        outcome.slug
                    ),
                };

                if outcome.renamed {
                    output.push_str(&format!(
                        "\n<note>slug was already taken; this subagent is \"{}\" — use that slug for future calls</note>",
                        outcome.slug
                    ));
                }

                let display_data = json!({
                    "slug": outcome.slug,
                    "conversation_id": outcome.conversation_id,
                });

                ToolOutput::success(output).with_display(display_data)
            }
            Err(e) => ToolOutput::error(format!("Failed to spawn subagent: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolRuntimeError;
    use crate::state_machine::state::ConvContext;
    use crate::tools::{BrowserSessionManager, SubagentOutcome, SubagentSpawner};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct StubSpawner {
        result: Result<SubagentOutcome, String>,
    }

    #[async_trait]
    impl SubagentSpawner for StubSpawner {
        async fn spawn(
            &self,
            _parent: &ConvContext,
            _input: SubagentInput,
        ) -> Result<SubagentOutcome, ToolRuntimeError> {
            self.result
                .clone()
                .map_err(ToolRuntimeError::Other)
        }
    }

    fn test_context(spawner: Arc<dyn SubagentSpawner>) -> ToolContext {
        let conv_ctx = ConvContext::new("parent-conv".to_string(), PathBuf::from("/tmp"), None);
        ToolContext::new(
            CancellationToken::new(),
            "parent-conv".to_string(),
            PathBuf::from("/tmp"),
            Arc::new(BrowserSessionManager::default()),
            Arc::new(crate::llm::ModelRegistry::new_empty()),
        )
        .with_conv_context(conv_ctx, spawner)
    }

    #[tokio::test]
    async fn completed_subagent_reports_text() {
        let spawner = Arc::new(StubSpawner {
            result: Ok(SubagentOutcome {
                slug: "worker".to_string(),
                conversation_id: "child-1".to_string(),
                renamed: false,
                status: SubagentStatus::Completed {
                    text: "done".to_string(),
                },
            }),
        });
        let tool = SubagentTool;
        let result = tool
            .run(
                json!({"slug": "worker", "prompt": "do the thing"}),
                test_context(spawner),
            )
            .await;
        assert!(result.success);
        assert!(result.output.contains("done"));
        assert!(!result.output.contains("note"));
    }

    #[tokio::test]
    async fn renamed_slug_surfaces_note() {
        let spawner = Arc::new(StubSpawner {
            result: Ok(SubagentOutcome {
                slug: "worker-2".to_string(),
                conversation_id: "child-2".to_string(),
                renamed: true,
                status: SubagentStatus::StillWorking,
            }),
        });
        let tool = SubagentTool;
        let result = tool
            .run(
                json!({"slug": "worker", "prompt": "do the thing", "wait": false}),
                test_context(spawner),
            )
            .await;
        assert!(result.success);
        assert!(result.output.contains("worker-2"));
        assert!(result.output.contains("<note>"));
    }

    #[tokio::test]
    async fn empty_slug_rejected() {
        let tool = SubagentTool;
        let result = tool
            .run(
                json!({"slug": "!!!", "prompt": "do the thing"}),
                test_context(Arc::new(StubSpawner {
                    result: Err("unreachable".to_string()),
                })),
            )
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn empty_prompt_rejected() {
        let tool = SubagentTool;
        let result = tool
            .run(
                json!({"slug": "worker", "prompt": "   "}),
                test_context(Arc::new(StubSpawner {
                    result: Err("unreachable".to_string()),
                })),
            )
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn timeout_is_clamped() {
        let spawner = Arc::new(StubSpawner {
            result: Ok(SubagentOutcome {
                slug: "worker".to_string(),
                conversation_id: "child-1".to_string(),
                renamed: false,
                status: SubagentStatus::StillWorking,
            }),
        });
        let tool = SubagentTool;
        let result = tool
            .run(
                json!({"slug": "worker", "prompt": "x", "timeout_seconds": 99999}),
                test_context(spawner),
            )
            .await;
        assert!(result.success);
        assert!(result.output.contains("300s"));
    }
}
