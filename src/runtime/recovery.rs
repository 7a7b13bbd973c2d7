//! Conversation recovery logic
//!
//! Handles detection of interrupted conversations that need auto-continuation.

use crate::db::{Message, MessageContent, MessageType};
use crate::llm::ContentBlock;
use crate::state_machine::ConvState;

/// Result of analyzing messages for recovery
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    /// The state to resume with
    pub state: ConvState,
    /// Whether auto-continuation is needed
    pub needs_auto_continue: bool,
    /// Reason for the decision (for debugging)
    pub reason: RecoveryReason,
}

/// Why we made a particular recovery decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryReason {
    /// No messages in conversation
    EmptyConversation,
    /// Last message is not a tool result
    LastMessageNotTool,
    /// No agent message found in conversation
    NoAgentMessage,
    /// Last agent message contains text (normal completion)
    AgentHasTextResponse,
    /// Last agent message is `tool_use` only, needs continuation
    InterruptedMidTurn,
}

impl RecoveryDecision {
    fn idle(reason: RecoveryReason) -> Self {
        Self {
            state: ConvState::Idle,
            needs_auto_continue: false,
            reason,
        }
    }

    fn auto_continue() -> Self {
        Self {
            state: ConvState::LlmRequesting { attempt: 1 },
            needs_auto_continue: true,
            reason: RecoveryReason::InterruptedMidTurn,
        }
    }
}

/// Analyze messages to determine if a conversation needs auto-continuation.
///
/// A conversation needs auto-continuation when:
/// 1. The last message is a tool result
/// 2. The last agent message contains only `tool_use` blocks (no text)
///
/// This indicates the conversation was interrupted after tools completed
/// but before the LLM could provide a text response.
pub fn should_auto_continue(messages: &[Message]) -> RecoveryDecision {
    // Empty conversation -> idle
    if messages.is_empty() {
        return RecoveryDecision::idle(RecoveryReason::EmptyConversation);
    }

    // Last message must be a tool result
    let last_msg = messages.last().unwrap();
    if !matches!(last_msg.message_type(), MessageType::Tool) {
        return RecoveryDecision::idle(RecoveryReason::LastMessageNotTool);
    }

    // Find the last agent message
    let last_agent = messages
        .iter()
        .rev()
        .find(|m| matches!(m.message_type(), MessageType::Agent));

    let Some(last_agent) = last_agent else {
        return RecoveryDecision::idle(RecoveryReason::NoAgentMessage);
    };

    // Check if the agent message has any text content
    let agent_has_text = match &last_agent.content {
        MessageContent::Agent { blocks } => blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::Text { .. })),
        // Non-agent content in agent message is unexpected, treat as having text (safe default)
        _ => true,
    };

    if agent_has_text {
        RecoveryDecision::idle(RecoveryReason::AgentHasTextResponse)
    } else {
        RecoveryDecision::auto_continue()
    }
}
