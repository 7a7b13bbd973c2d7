//! Events that drive conversation state transitions.

use crate::db::{ErrorKind, ImageData};
use crate::llm::{ContentBlock, Usage};
use crate::state_machine::state::{ToolCall, ToolOutcome};

#[derive(Debug, Clone)]
pub enum Event {
    UserMessage {
        text: String,
        images: Vec<ImageData>,
        message_id: String,
    },
    UserCancel,

    LlmResponse {
        content: Vec<ContentBlock>,
        tool_calls: Vec<ToolCall>,
        end_turn: bool,
        usage: Usage,
    },
    LlmError {
        message: String,
        error_kind: ErrorKind,
        attempt: u32,
    },
    LlmAborted,
    RetryTimeout {
        attempt: u32,
    },

    ToolComplete {
        tool_use_id: String,
        result: ToolOutcome,
    },
    ToolAborted {
        tool_use_id: String,
    },

    /// The child conversation spawned by a `subagent(wait: true)` call
    /// finished (or the wait timed out) before the turn continues.
    SubagentComplete {
        tool_use_id: String,
        result: ToolOutcome,
    },
    SubagentTimedOut {
        tool_use_id: String,
    },
}
