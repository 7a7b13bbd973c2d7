//! Drives one conversation's turn loop: pulls events off its channel,
//! runs them through the pure [`transition`] function, and performs the
//! effects it returns. This is the only place in the engine that touches
//! the database, the LLM, or the tool registry.

use super::SseEvent;
use crate::bus::{BusEvent, EventBus};
use crate::db::{ConversationState as PersistedState, Database};
use crate::git_status::{self, GitSnapshot};
use crate::llm::{LlmMessage, LlmRequest, MessageRole, ModelRegistry, SystemContent};
use crate::state_machine::state::{ToolCall, ToolOutcome};
use crate::state_machine::{transition, ConvContext, ConvState, Effect, Event};
use crate::tools::{BrowserSessionManager, SubagentSpawner, ToolContext, ToolRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub struct ConversationRuntime {
    context: ConvContext,
    state: ConvState,
    db: Database,
    llm_registry: Arc<ModelRegistry>,
    browser_sessions: Arc<BrowserSessionManager>,
    bus: Arc<EventBus>,
    subagents: Arc<dyn SubagentSpawner>,
    cancel: CancellationToken,
    event_rx: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,
    broadcast_tx: broadcast::Sender<SseEvent>,
    /// Snapshotted at the start of a turn, compared against the state
    /// after the turn ends to decide whether to emit a `gitinfo` message.
    turn_start_git: Option<GitSnapshot>,
}

impl ConversationRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: ConvContext,
        state: ConvState,
        db: Database,
        llm_registry: Arc<ModelRegistry>,
        browser_sessions: Arc<BrowserSessionManager>,
        bus: Arc<EventBus>,
        subagents: Arc<dyn SubagentSpawner>,
        event_rx: mpsc::Receiver<Event>,
        event_tx: mpsc::Sender<Event>,
        broadcast_tx: broadcast::Sender<SseEvent>,
    ) -> Self {
        Self {
            context,
            state,
            db,
            llm_registry,
            browser_sessions,
            bus,
            subagents,
            cancel: CancellationToken::new(),
            event_rx,
            event_tx,
            broadcast_tx,
            turn_start_git: None,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(conv_id = %self.context.conversation_id, "conversation runtime started");

        while let Some(event) = self.event_rx.recv().await {
            if let Err(e) = self.process_event(event).await {
                tracing::error!(conv_id = %self.context.conversation_id, error = %e, "event handling failed");
                let _ = self.broadcast_tx.send(SseEvent::Error { message: e });
            }
        }

        tracing::info!(conv_id = %self.context.conversation_id, "conversation runtime stopped");
    }

    async fn process_event(&mut self, event: Event) -> Result<(), String> {
        if matches!(event, Event::UserMessage { .. }) {
            self.cancel = CancellationToken::new();
            self.turn_start_git = git_status::snapshot(&self.context.cwd).await;
        }

        let mut pending = vec![event];
        while let Some(current) = pending.pop() {
            let result = transition(&self.state, &self.context, current).map_err(|e| e.to_string())?;
            self.state = result.state;

            for effect in result.effects {
                if let Some(generated) = self.execute_effect(effect).await? {
                    pending.push(generated);
                }
            }
        }

        Ok(())
    }

    async fn execute_effect(&mut self, effect: Effect) -> Result<Option<Event>, String> {
        match effect {
            Effect::PersistMessage { message_id, content, display_data, usage_data } => {
                let msg = self
                    .db
                    .append_message(&message_id, &self.context.conversation_id, &content, display_data.as_ref(), usage_data)
                    .map_err(|e| e.to_string())?;
                let msg_json = serde_json::to_value(&msg).unwrap_or(Value::Null);
                let _ = self.broadcast_tx.send(SseEvent::Message { message: msg_json });
                self.bus.publish(&self.context.conversation_id, BusEvent::message_appended(self.context.conversation_id.clone(), msg));
                Ok(None)
            }

            Effect::PersistState { state, state_data } => {
                self.db
                    .update_conversation_state(&self.context.conversation_id, state, state_data.as_ref())
                    .map_err(|e| e.to_string())?;

                let state_json = serde_json::to_value(&self.state).unwrap_or(Value::Null);
                let _ = self.broadcast_tx.send(SseEvent::StateChange { state: state_json });
                if !matches!(state, PersistedState::Working) {
                    let _ = self.broadcast_tx.send(SseEvent::AgentDone);
                    self.emit_gitinfo_if_changed().await;
                }
                Ok(None)
            }

            Effect::RequestLlm => Ok(Some(self.request_llm().await)),

            Effect::ExecuteTool { call } => Ok(Some(self.execute_tool(call).await)),

            Effect::AbortTool { .. } | Effect::AbortLlm => {
                self.cancel.cancel();
                Ok(None)
            }

            Effect::NotifyClient { event } => {
                self.bus.publish(&self.context.conversation_id, event);
                Ok(None)
            }

            Effect::ScheduleRetry { delay, attempt } => {
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = event_tx.send(Event::RetryTimeout { attempt }).await;
                });
                Ok(None)
            }
        }
    }

    /// Compares the turn's starting git snapshot against the repo's state
    /// now; if HEAD moved or dirtiness flipped, persists an
    /// `excluded_from_context` `gitinfo` message so the UI can show it.
    async fn emit_gitinfo_if_changed(&mut self) {
        let Some(before) = self.turn_start_git.take() else {
            // No baseline taken for this turn (e.g. a reconciliation on
            // restart rather than a fresh `Event::UserMessage`) — nothing
            // to compare against, so stay silent rather than guess.
            return;
        };
        let Some(after) = git_status::snapshot(&self.context.cwd).await else {
            return;
        };
        if before == after {
            return;
        }

        let summary = git_status::summarize(Some(&before), &after);
        let content = crate::db::MessageContent::gitinfo(after.head_sha.clone(), after.dirty, summary);
        let message_id = uuid::Uuid::new_v4().to_string();
        match self.db.append_message(&message_id, &self.context.conversation_id, &content, None, None) {
            Ok(msg) => {
                let msg_json = serde_json::to_value(&msg).unwrap_or(Value::Null);
                let _ = self.broadcast_tx.send(SseEvent::Message { message: msg_json });
                self.bus.publish(&self.context.conversation_id, BusEvent::message_appended(self.context.conversation_id.clone(), msg));
            }
            Err(e) => {
                tracing::warn!(conv_id = %self.context.conversation_id, error = %e, "failed to persist gitinfo message");
            }
        }
    }

    fn build_llm_messages(&self) -> Result<Vec<LlmMessage>, String> {
        let messages = self
            .db
            .list_messages_for_context(&self.context.conversation_id)
            .map_err(|e| e.to_string())?;

        Ok(messages
            .iter()
            .filter_map(|m| m.content.as_llm_blocks())
            .map(|(role, content)| LlmMessage { role, content })
            .collect())
    }

    fn request_body_json(request: &LlmRequest) -> String {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        MessageRole::User => "user",
                        MessageRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();
        serde_json::to_string(&json!({
            "system": request.system.iter().map(|s| &s.text).collect::<Vec<_>>(),
            "messages": messages,
            "tools": request.tools.iter().map(|t| &t.name).collect::<Vec<_>>(),
            "max_tokens": request.max_tokens,
        }))
        .unwrap_or_default()
    }

    async fn request_llm(&mut self) -> Event {
        let attempt = match &self.state {
            ConvState::LlmRequesting { attempt } => *attempt,
            _ => 1,
        };

        let messages = match self.build_llm_messages() {
            Ok(m) => m,
            Err(e) => {
                return Event::LlmError { message: e, error_kind: crate::db::ErrorKind::Unknown, attempt };
            }
        };

        let model_id = self.context.model.clone().unwrap_or_else(|| self.llm_registry.default_model_id().to_string());
        let Some(llm) = self.llm_registry.get(&model_id).or_else(|| self.llm_registry.default()) else {
            return Event::LlmError {
                message: format!("model '{model_id}' is not available"),
                error_kind: crate::db::ErrorKind::Unknown,
                attempt,
            };
        };

        let tool_registry = self.tool_registry_for_model(&model_id);
        let system_prompt = crate::system_prompt::build_system_prompt(&self.context.cwd, self.context.is_sub_agent());
        let request = LlmRequest {
            system: vec![SystemContent::cached(&system_prompt)],
            messages,
            tools: tool_registry.definitions(),
            max_tokens: Some(8192),
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let request_body = Self::request_body_json(&request);
        if let Err(e) = self.db.insert_llm_request(&request_id, Some(&self.context.conversation_id), &request_body) {
            tracing::warn!(error = %e, "failed to persist llm request body");
        }

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            () = cancel.cancelled() => return Event::LlmAborted,
            result = llm.complete(&request) => result,
        };

        match result {
            Ok(response) => {
                let response_body = serde_json::to_string(&json!({
                    "content": &response.content,
                    "end_turn": response.end_turn,
                }))
                .unwrap_or_default();
                if let Err(e) = self.db.record_llm_response(&request_id, &response_body) {
                    tracing::warn!(error = %e, "failed to persist llm response body");
                }

                let tool_calls: Vec<ToolCall> = response
                    .tool_uses()
                    .into_iter()
                    .map(|(id, name, input)| ToolCall { id: id.to_string(), name: name.to_string(), input: input.clone() })
                    .collect();

                Event::LlmResponse {
                    content: response.content,
                    tool_calls,
                    end_turn: response.end_turn,
                    usage: response.usage,
                }
            }
            Err(e) => Event::LlmError { message: e.message.clone(), error_kind: e.kind.into(), attempt },
        }
    }

    /// `ToolRegistry::for_context`, gated on the model's screenshot capability
    /// as recorded in the `models` table. Missing rows (tests, models not
    /// yet seeded) default to supported so the registry stays permissive.
    fn tool_registry_for_model(&self, model_id: &str) -> ToolRegistry {
        let screenshots_supported = self
            .db
            .get_model(model_id)
            .ok()
            .flatten()
            .map_or(true, |m| m.supports_screenshots());
        ToolRegistry::for_context_with_capabilities(&self.context, screenshots_supported)
    }

    async fn execute_tool(&mut self, call: ToolCall) -> Event {
        let tool_use_id = call.id.clone();
        let name = call.name.clone();

        tracing::info!(conv_id = %self.context.conversation_id, tool = %name, id = %tool_use_id, "executing tool");

        let ctx = ToolContext::new(
            self.cancel.clone(),
            self.context.conversation_id.clone(),
            self.context.cwd.clone(),
            self.browser_sessions.clone(),
            self.llm_registry.clone(),
        )
        .with_conv_context(self.context.clone(), self.subagents.clone());

        let model_id = self.context.model.clone().unwrap_or_else(|| self.llm_registry.default_model_id().to_string());
        let registry = self.tool_registry_for_model(&model_id);
        let cancel = self.cancel.clone();

        let outcome = tokio::select! {
            () = cancel.cancelled() => return Event::ToolAborted { tool_use_id },
            output = registry.execute(&name, call.input, ctx) => output,
        };

        let result = match outcome {
            Some(output) => {
                if let Some(new_cwd) = &output.cwd_change {
                    self.context.cwd = new_cwd.clone();
                    if let Err(e) = self.db.set_cwd(&self.context.conversation_id, &new_cwd.display().to_string()) {
                        tracing::warn!(conv_id = %self.context.conversation_id, error = %e, "failed to persist cwd change");
                    }
                }
                ToolOutcome {
                    tool_use_id: tool_use_id.clone(),
                    llm_content: output.output,
                    is_error: !output.success,
                    display_data: output.display_data,
                }
            }
            None => ToolOutcome {
                tool_use_id: tool_use_id.clone(),
                llm_content: format!("Unknown tool: {name}"),
                is_error: true,
                display_data: None,
            },
        };

        Event::ToolComplete { tool_use_id, result }
    }
}
