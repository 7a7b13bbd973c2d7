//! Effects produced by a state transition. The executor is the only
//! thing that performs them; `transition` itself stays pure.

use crate::bus::BusEvent;
use crate::db::{ConversationState, MessageContent, UsageData};
use crate::state_machine::state::ToolCall;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Effect {
    PersistMessage {
        message_id: String,
        content: MessageContent,
        display_data: Option<Value>,
        usage_data: Option<UsageData>,
    },
    PersistState {
        state: ConversationState,
        state_data: Option<Value>,
    },
    /// Build (from persisted history + the system prompt + tool
    /// schemas), persist, and send the next LLM request.
    RequestLlm,
    ExecuteTool {
        call: ToolCall,
    },
    AbortTool {
        tool_use_id: String,
    },
    AbortLlm,
    NotifyClient {
        event: BusEvent,
    },
    ScheduleRetry {
        delay: Duration,
        attempt: u32,
    },
}

impl Effect {
    pub fn persist_user_message(message_id: impl Into<String>, content: MessageContent) -> Self {
        Effect::PersistMessage {
            message_id: message_id.into(),
            content,
            display_data: None,
            usage_data: None,
        }
    }

    pub fn persist_agent_message(
        message_id: impl Into<String>,
        content: MessageContent,
        display_data: Option<Value>,
        usage_data: UsageData,
    ) -> Self {
        Effect::PersistMessage {
            message_id: message_id.into(),
            content,
            display_data,
            usage_data: Some(usage_data),
        }
    }

    pub fn persist_tool_message(
        message_id: impl Into<String>,
        tool_use_id: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
        display_data: Option<Value>,
    ) -> Self {
        Effect::PersistMessage {
            message_id: message_id.into(),
            content: MessageContent::tool(tool_use_id, output, is_error),
            display_data,
            usage_data: None,
        }
    }

    pub fn notify_state_change(conversation_id: impl Into<String>, working: bool, model: Option<String>) -> Self {
        Effect::NotifyClient {
            event: BusEvent::conversation_state(conversation_id, working, model),
        }
    }
}
