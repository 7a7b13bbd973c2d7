//! Pure state transition function (Elm architecture): given the current
//! state, the conversation's context, and an incoming event, produces
//! the next state plus the effects the executor must perform. No I/O
//! happens here, which is what makes this function exhaustively
//! testable without a database or network.

use crate::db::{ConversationState as PersistedState, ErrorKind, MessageContent};
use crate::state_machine::effect::Effect;
use crate::state_machine::event::Event;
use crate::state_machine::state::{ConvContext, ConvState, ToolOutcome};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("event {event} is not valid in state {state}")]
pub struct TransitionError {
    pub state: String,
    pub event: String,
}

fn invalid(state: &ConvState, event: &str) -> TransitionError {
    TransitionError {
        state: format!("{state:?}"),
        event: event.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    fn new(state: ConvState, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }
}

pub fn transition(
    state: &ConvState,
    ctx: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match event {
        Event::UserCancel => handle_cancel(state),
        Event::UserMessage { text, images, message_id } => handle_user_message(state, text, images, message_id),
        Event::LlmResponse { content, tool_calls, end_turn, usage } => {
            handle_llm_response(state, ctx, content, tool_calls, end_turn, usage)
        }
        Event::LlmError { message, error_kind, attempt } => handle_llm_error(state, message, error_kind, attempt),
        Event::LlmAborted => handle_llm_aborted(state),
        Event::RetryTimeout { attempt } => handle_retry_timeout(state, attempt),
        Event::ToolComplete { tool_use_id, result } => handle_tool_complete(state, ctx, tool_use_id, result),
        Event::ToolAborted { tool_use_id } => handle_tool_aborted(state, tool_use_id),
        Event::SubagentComplete { tool_use_id, result } => handle_tool_complete(state, ctx, tool_use_id, result),
        Event::SubagentTimedOut { tool_use_id } => {
            // A wait=true subagent call that hit its external timeout still
            // returns a normal (non-error) tool result; the child keeps
            // running.
            let still_working = ToolOutcome {
                tool_use_id: tool_use_id.clone(),
                llm_content: "subagent is still working; call again later or omit `wait`".to_string(),
                is_error: false,
                display_data: None,
            };
            handle_tool_complete(state, ctx, tool_use_id, still_working)
        }
    }
}

fn handle_user_message(
    state: &ConvState,
    text: String,
    images: Vec<crate::db::ImageData>,
    message_id: String,
) -> Result<TransitionResult, TransitionError> {
    if !matches!(state, ConvState::Idle) {
        return Err(invalid(state, "UserMessage"));
    }
    let effects = vec![
        Effect::persist_user_message(message_id, MessageContent::user_with_images(text, images)),
        Effect::PersistState {
            state: PersistedState::Working,
            state_data: None,
        },
        Effect::RequestLlm,
    ];
    Ok(TransitionResult::new(ConvState::AwaitingLlm, effects))
}

fn handle_cancel(state: &ConvState) -> Result<TransitionResult, TransitionError> {
    if !state.is_working() {
        // Cancellation is idempotent: cancelling an already-idle/errored
        // conversation is a no-op, not an error.
        return Ok(TransitionResult::new(state.clone(), vec![]));
    }

    let pending_tool_id = match state {
        ConvState::ToolExecuting { calls, current, .. } => calls.get(*current).map(|c| c.id.clone()),
        _ => None,
    };

    let mut effects = vec![Effect::AbortLlm];
    if let Some(id) = &pending_tool_id {
        effects.push(Effect::AbortTool { tool_use_id: id.clone() });
    }

    Ok(TransitionResult::new(
        ConvState::Cancelling { pending_tool_id },
        effects,
    ))
}

fn handle_llm_aborted(state: &ConvState) -> Result<TransitionResult, TransitionError> {
    match state {
        ConvState::Cancelling { pending_tool_id: None } => Ok(finish_cancellation()),
        ConvState::Cancelling { .. } => {
            // Still waiting on a tool abort to land.
            Ok(TransitionResult::new(state.clone(), vec![]))
        }
        _ => Err(invalid(state, "LlmAborted")),
    }
}

fn handle_tool_aborted(state: &ConvState, tool_use_id: String) -> Result<TransitionResult, TransitionError> {
    match state {
        ConvState::Cancelling { pending_tool_id } if pending_tool_id.as_deref() == Some(tool_use_id.as_str()) => {
            let mut result = finish_cancellation();
            result.effects.insert(
                0,
                Effect::persist_tool_message(Uuid::new_v4().to_string(), tool_use_id, "cancelled", false, None),
            );
            Ok(result)
        }
        _ => Err(invalid(state, "ToolAborted")),
    }
}

fn finish_cancellation() -> TransitionResult {
    TransitionResult::new(
        ConvState::Idle,
        vec![
            Effect::persist_user_message(Uuid::new_v4().to_string(), MessageContent::error("cancelled")),
            Effect::PersistState {
                state: PersistedState::Idle,
                state_data: None,
            },
        ],
    )
}

fn handle_llm_response(
    state: &ConvState,
    ctx: &ConvContext,
    content: Vec<crate::llm::ContentBlock>,
    tool_calls: Vec<crate::state_machine::state::ToolCall>,
    end_turn: bool,
    usage: crate::llm::Usage,
) -> Result<TransitionResult, TransitionError> {
    if !matches!(state, ConvState::AwaitingLlm | ConvState::LlmRequesting { .. }) {
        return Err(invalid(state, "LlmResponse"));
    }

    let message_id = Uuid::new_v4().to_string();
    let mut effects = vec![Effect::persist_agent_message(
        message_id,
        MessageContent::agent(content),
        None,
        usage.into(),
    )];

    if end_turn || tool_calls.is_empty() {
        effects.push(Effect::PersistState {
            state: PersistedState::Idle,
            state_data: None,
        });
        effects.push(Effect::notify_state_change(ctx.conversation_id.clone(), false, ctx.model.clone()));
        return Ok(TransitionResult::new(ConvState::Idle, effects));
    }

    effects.push(Effect::ExecuteTool { call: tool_calls[0].clone() });
    Ok(TransitionResult::new(
        ConvState::ToolExecuting {
            calls: tool_calls,
            current: 0,
            results: Vec::new(),
        },
        effects,
    ))
}

fn handle_tool_complete(
    state: &ConvState,
    ctx: &ConvContext,
    tool_use_id: String,
    result: ToolOutcome,
) -> Result<TransitionResult, TransitionError> {
    let ConvState::ToolExecuting { calls, current, results } = state else {
        return Err(invalid(state, "ToolComplete"));
    };
    if calls.get(*current).map(|c| c.id.as_str()) != Some(tool_use_id.as_str()) {
        return Err(invalid(state, "ToolComplete (out of order)"));
    }

    let mut effects = vec![Effect::persist_tool_message(
        Uuid::new_v4().to_string(),
        &tool_use_id,
        &result.llm_content,
        result.is_error,
        result.display_data.clone(),
    )];

    let mut results = results.clone();
    results.push(result);
    let next = current + 1;

    if next < calls.len() {
        effects.push(Effect::ExecuteTool { call: calls[next].clone() });
        return Ok(TransitionResult::new(
            ConvState::ToolExecuting {
                calls: calls.clone(),
                current: next,
                results,
            },
            effects,
        ));
    }

    // All tools for this turn have returned: loop back to the model.
    effects.push(Effect::RequestLlm);
    Ok(TransitionResult::new(ConvState::AwaitingLlm, effects))
}

fn handle_llm_error(
    state: &ConvState,
    message: String,
    error_kind: ErrorKind,
    _attempt: u32,
) -> Result<TransitionResult, TransitionError> {
    if !matches!(state, ConvState::AwaitingLlm | ConvState::LlmRequesting { .. }) {
        return Err(invalid(state, "LlmError"));
    }
    let effects = vec![
        Effect::persist_user_message(Uuid::new_v4().to_string(), MessageContent::error(&message)),
        Effect::PersistState {
            state: PersistedState::Errored,
            state_data: None,
        },
    ];
    Ok(TransitionResult::new(
        ConvState::Errored { message, error_kind },
        effects,
    ))
}

fn handle_retry_timeout(state: &ConvState, attempt: u32) -> Result<TransitionResult, TransitionError> {
    if !matches!(state, ConvState::LlmRequesting { .. }) {
        return Err(invalid(state, "RetryTimeout"));
    }
    Ok(TransitionResult::new(
        ConvState::LlmRequesting { attempt },
        vec![Effect::RequestLlm],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Usage;
    use std::path::PathBuf;

    fn ctx() -> ConvContext {
        ConvContext::new("c000001", PathBuf::from("/tmp"), Some("predictable".into()))
    }

    #[test]
    fn user_message_from_idle_enters_working() {
        let result = transition(
            &ConvState::Idle,
            &ctx(),
            Event::UserMessage {
                text: "hi".into(),
                images: vec![],
                message_id: "m1".into(),
            },
        )
        .unwrap();
        assert_eq!(result.state, ConvState::AwaitingLlm);
        assert!(matches!(result.effects[2], Effect::RequestLlm));
    }

    #[test]
    fn llm_response_without_tools_returns_to_idle() {
        let result = transition(
            &ConvState::AwaitingLlm,
            &ctx(),
            Event::LlmResponse {
                content: vec![crate::llm::ContentBlock::text("done")],
                tool_calls: vec![],
                end_turn: true,
                usage: Usage::default(),
            },
        )
        .unwrap();
        assert_eq!(result.state, ConvState::Idle);
    }

    #[test]
    fn llm_response_with_tool_calls_executes_first_tool() {
        let call = crate::state_machine::state::ToolCall {
            id: "t1".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        let result = transition(
            &ConvState::AwaitingLlm,
            &ctx(),
            Event::LlmResponse {
                content: vec![crate::llm::ContentBlock::tool_use("t1", "bash", serde_json::json!({}))],
                tool_calls: vec![call],
                end_turn: false,
                usage: Usage::default(),
            },
        )
        .unwrap();
        assert!(matches!(result.state, ConvState::ToolExecuting { current: 0, .. }));
    }

    #[test]
    fn tool_results_dispatch_in_order() {
        let calls = vec![
            crate::state_machine::state::ToolCall { id: "t1".into(), name: "bash".into(), input: serde_json::json!({}) },
            crate::state_machine::state::ToolCall { id: "t2".into(), name: "bash".into(), input: serde_json::json!({}) },
        ];
        let state = ConvState::ToolExecuting { calls, current: 0, results: vec![] };
        let result = transition(
            &state,
            &ctx(),
            Event::ToolComplete {
                tool_use_id: "t1".into(),
                result: ToolOutcome { tool_use_id: "t1".into(), llm_content: "ok".into(), is_error: false, display_data: None },
            },
        )
        .unwrap();
        assert!(matches!(result.state, ConvState::ToolExecuting { current: 1, .. }));
        assert!(matches!(result.effects.last(), Some(Effect::ExecuteTool { .. })));
    }

    #[test]
    fn last_tool_result_loops_back_to_llm() {
        let calls = vec![crate::state_machine::state::ToolCall { id: "t1".into(), name: "bash".into(), input: serde_json::json!({}) }];
        let state = ConvState::ToolExecuting { calls, current: 0, results: vec![] };
        let result = transition(
            &state,
            &ctx(),
            Event::ToolComplete {
                tool_use_id: "t1".into(),
                result: ToolOutcome { tool_use_id: "t1".into(), llm_content: "ok".into(), is_error: false, display_data: None },
            },
        )
        .unwrap();
        assert_eq!(result.state, ConvState::AwaitingLlm);
        assert!(matches!(result.effects.last(), Some(Effect::RequestLlm)));
    }

    #[test]
    fn cancel_while_idle_is_a_noop() {
        let result = transition(&ConvState::Idle, &ctx(), Event::UserCancel).unwrap();
        assert_eq!(result.state, ConvState::Idle);
        assert!(result.effects.is_empty());
    }

    #[test]
    fn cancel_during_tool_aborts_it_then_settles_on_tool_aborted() {
        let calls = vec![crate::state_machine::state::ToolCall { id: "t1".into(), name: "bash".into(), input: serde_json::json!({}) }];
        let state = ConvState::ToolExecuting { calls, current: 0, results: vec![] };
        let cancelled = transition(&state, &ctx(), Event::UserCancel).unwrap();
        assert!(matches!(cancelled.state, ConvState::Cancelling { pending_tool_id: Some(ref id) } if id == "t1"));

        let settled = transition(&cancelled.state, &ctx(), Event::ToolAborted { tool_use_id: "t1".into() }).unwrap();
        assert_eq!(settled.state, ConvState::Idle);
    }

    #[test]
    fn out_of_order_tool_complete_is_rejected() {
        let calls = vec![
            crate::state_machine::state::ToolCall { id: "t1".into(), name: "bash".into(), input: serde_json::json!({}) },
            crate::state_machine::state::ToolCall { id: "t2".into(), name: "bash".into(), input: serde_json::json!({}) },
        ];
        let state = ConvState::ToolExecuting { calls, current: 0, results: vec![] };
        let result = transition(
            &state,
            &ctx(),
            Event::ToolComplete {
                tool_use_id: "t2".into(),
                result: ToolOutcome { tool_use_id: "t2".into(), llm_content: "ok".into(), is_error: false, display_data: None },
            },
        );
        assert!(result.is_err());
    }
}
