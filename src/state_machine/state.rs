//! In-memory conversation state and the tool-call/input shapes that flow
//! through it. Only the coarse [`crate::db::ConversationState`]
//! (`Idle`/`Working`/`Errored`/`Cancelled`) is durably persisted; this
//! finer-grained `ConvState` lives for the duration of the owning task
//! and drives the pure [`super::transition`] function.

use crate::llm::{LlmRequest, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// The hard ceiling on subagent recursion depth, imposed even when the
/// configured `max_depth` is `0` ("unlimited") — see `DESIGN.md` for the
/// rationale.
pub const HARD_MAX_DEPTH: u32 = 8;

pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Everything the engine needs about the conversation it is running,
/// independent of the turn currently in flight.
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub conversation_id: String,
    pub parent_conversation_id: Option<String>,
    pub depth: u32,
    /// `0` means "unlimited" as configured, but [`HARD_MAX_DEPTH`] always
    /// applies on top of it.
    pub max_depth: u32,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub context_window: usize,
}

impl ConvContext {
    pub fn new(conversation_id: impl Into<String>, cwd: PathBuf, model: Option<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            parent_conversation_id: None,
            depth: 0,
            max_depth: 0,
            cwd,
            model,
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    pub fn sub_agent(parent: &ConvContext, conversation_id: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            parent_conversation_id: Some(parent.conversation_id.clone()),
            depth: parent.depth + 1,
            max_depth: parent.max_depth,
            cwd,
            model: parent.model.clone(),
            context_window: parent.context_window,
        }
    }

    pub fn is_sub_agent(&self) -> bool {
        self.parent_conversation_id.is_some()
    }

    /// The `subagent` tool is present in this conversation's registry
    /// only if spawning a child wouldn't itself hit the ceiling.
    pub fn subagent_tool_allowed(&self) -> bool {
        let effective_max = if self.max_depth == 0 {
            HARD_MAX_DEPTH
        } else {
            self.max_depth.min(HARD_MAX_DEPTH)
        };
        self.depth + 1 < effective_max
    }
}

/// Fine-grained state for the turn loop. `Idle`/terminal states map onto
/// the persisted [`crate::db::ConversationState`]; everything else is
/// `Working`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ConvState {
    Idle,
    AwaitingLlm,
    LlmRequesting {
        attempt: u32,
    },
    ToolExecuting {
        calls: Vec<ToolCall>,
        current: usize,
        results: Vec<ToolOutcome>,
    },
    Cancelling {
        pending_tool_id: Option<String>,
    },
    Errored {
        message: String,
        error_kind: crate::db::ErrorKind,
    },
}

impl Default for ConvState {
    fn default() -> Self {
        ConvState::Idle
    }
}

impl ConvState {
    pub fn is_working(&self) -> bool {
        !matches!(self, ConvState::Idle | ConvState::Errored { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub tool_use_id: String,
    pub llm_content: String,
    pub is_error: bool,
    pub display_data: Option<Value>,
}

/// Input to the single `subagent` tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubagentInput {
    pub slug: String,
    pub prompt: String,
    pub timeout_seconds: Option<u32>,
    pub wait: Option<bool>,
}

/// A completed or in-flight LLM request, kept around only long enough to
/// pair a response with the request that produced it.
#[derive(Debug, Clone)]
pub struct PendingLlmRequest {
    pub id: String,
    pub request: LlmRequest,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TurnUsage {
    pub total: Option<Usage>,
}
