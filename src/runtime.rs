//! Conversation runtime: owns one [`ConversationRuntime`] task per live
//! conversation, started lazily on first event/subscription and kept
//! running until the process exits. Implements [`SubagentSpawner`] so the
//! `subagent` tool can resolve-or-create and run a child conversation
//! without `tools` depending back on this module.
//!
//! REQ-BED-007: State Persistence
//! REQ-BED-008: Sub-Agent Spawning
//! REQ-BED-009: Sub-Agent Isolation
//! REQ-BED-010: Fixed Working Directory
//! REQ-BED-011: Real-time Event Streaming
//! REQ-BED-012: Context Window Tracking

mod executor;
mod recovery;

pub use executor::ConversationRuntime;

use crate::bus::{BusEvent, EventBus};
use crate::db::{Database, MessageContent};
use crate::error::ToolRuntimeError;
use crate::llm::ModelRegistry;
use crate::state_machine::state::SubagentInput;
use crate::state_machine::{ConvContext, ConvState, Event};
use crate::tools::{BrowserSessionManager, SubagentOutcome, SubagentSpawner, SubagentStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Handle to a running conversation's event and broadcast channels.
#[derive(Clone)]
pub struct ConversationHandle {
    pub event_tx: mpsc::Sender<Event>,
    pub broadcast_tx: broadcast::Sender<SseEvent>,
}

/// Events delivered to a conversation's SSE subscribers.
#[derive(Debug, Clone)]
pub enum SseEvent {
    Init {
        conversation: serde_json::Value,
        messages: Vec<serde_json::Value>,
        agent_working: bool,
        last_sequence_id: i64,
        /// Current context window usage in tokens.
        context_window_size: u64,
        /// Model's maximum context window in tokens, for the usage percentage.
        model_context_window: usize,
        breadcrumbs: Vec<serde_json::Value>,
    },
    Message {
        message: serde_json::Value,
    },
    /// The full in-memory turn state, as JSON (e.g. `{"phase":"tool_executing",...}`).
    StateChange {
        state: serde_json::Value,
    },
    AgentDone,
    Error {
        message: String,
    },
}

/// Manages all conversation runtimes: one [`ConversationRuntime`] task per
/// conversation, lazily started and kept alive for the life of the process.
pub struct RuntimeManager {
    db: Database,
    llm_registry: Arc<ModelRegistry>,
    browser_sessions: Arc<BrowserSessionManager>,
    bus: Arc<EventBus>,
    runtimes: RwLock<HashMap<String, ConversationHandle>>,
}

impl RuntimeManager {
    pub fn new(db: Database, llm_registry: Arc<ModelRegistry>) -> Self {
        Self {
            db,
            llm_registry,
            browser_sessions: Arc::new(BrowserSessionManager::default()),
            bus: Arc::new(EventBus::new()),
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    pub fn browser_sessions(&self) -> &Arc<BrowserSessionManager> {
        &self.browser_sessions
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn model_registry(&self) -> &ModelRegistry {
        &self.llm_registry
    }

    pub fn llm_registry(&self) -> &Arc<ModelRegistry> {
        &self.llm_registry
    }

    /// Returns the running handle for `conversation_id`, starting its
    /// runtime task first if it isn't already live.
    pub async fn get_or_create(self: &Arc<Self>, conversation_id: &str) -> Result<ConversationHandle, String> {
        if let Some(handle) = self.runtimes.read().await.get(conversation_id) {
            return Ok(handle.clone());
        }

        let conv = self
            .db
            .get_conversation(conversation_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("conversation {conversation_id} not found"))?;

        let model_id = conv.model.clone().or_else(|| Some(self.llm_registry.default_model_id().to_string()));
        let context = if let Some(parent_id) = &conv.parent_conversation_id {
            let mut ctx = ConvContext::sub_agent(
                &ConvContext::new(parent_id.clone(), PathBuf::from(&conv.cwd), model_id.clone()),
                conv.id.clone(),
                PathBuf::from(&conv.cwd),
            );
            ctx.model = model_id;
            ctx
        } else {
            ConvContext::new(conv.id.clone(), PathBuf::from(&conv.cwd), model_id)
        };

        let (initial_state, needs_auto_continue) = self.determine_resume_state(conversation_id)?;
        if needs_auto_continue {
            tracing::info!(conv_id = %conversation_id, "auto-continuing interrupted conversation");
        }

        self.bus.register(conversation_id, conv.parent_conversation_id.clone());

        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, _) = broadcast::channel(128);

        let spawner = Arc::new(Spawner(Arc::clone(self)));
        let runtime = ConversationRuntime::new(
            context,
            initial_state,
            self.db.clone(),
            self.llm_registry.clone(),
            self.browser_sessions.clone(),
            self.bus.clone(),
            spawner,
            event_rx,
            event_tx.clone(),
            broadcast_tx.clone(),
        );

        let handle = ConversationHandle { event_tx, broadcast_tx };
        self.runtimes.write().await.insert(conversation_id.to_string(), handle.clone());

        let conv_id = conversation_id.to_string();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(conv_id = %conv_id, "conversation runtime finished");
        });

        if needs_auto_continue {
            // The turn loop only advances on incoming events; kick the
            // resumed `LlmRequesting` state with the same event a retry
            // timer would send so the model call actually fires.
            let _ = handle.event_tx.send(Event::RetryTimeout { attempt: 1 }).await;
        }

        Ok(handle)
    }

    pub async fn send_event(self: &Arc<Self>, conversation_id: &str, event: Event) -> Result<(), String> {
        let handle = self.get_or_create(conversation_id).await?;
        handle.event_tx.send(event).await.map_err(|e| format!("failed to send event: {e}"))
    }

    pub async fn subscribe(self: &Arc<Self>, conversation_id: &str) -> Result<broadcast::Receiver<SseEvent>, String> {
        let handle = self.get_or_create(conversation_id).await?;
        Ok(handle.broadcast_tx.subscribe())
    }

    /// Delegates to [`recovery::should_auto_continue`]; see that module for
    /// the interrupted-turn detection logic and its tests.
    fn determine_resume_state(&self, conversation_id: &str) -> Result<(ConvState, bool), String> {
        let messages = self.db.list_messages(conversation_id).map_err(|e| e.to_string())?;
        let decision = recovery::should_auto_continue(&messages);
        Ok((decision.state, decision.needs_auto_continue))
    }

    /// Resolve-or-create the child conversation named by `input.slug` under
    /// `parent`, ensure its runtime is running, optionally seed it with
    /// `input.prompt`, and (if `wait`) block until it goes idle or the
    /// timeout elapses.
    async fn spawn_subagent(
        self: &Arc<Self>,
        parent: &ConvContext,
        input: SubagentInput,
    ) -> Result<SubagentOutcome, ToolRuntimeError> {
        let (conv, existed) = self
            .db
            .get_or_create_subagent(&input.slug, &parent.conversation_id, &parent.cwd.display().to_string(), parent.model.as_deref())
            .map_err(|e| ToolRuntimeError::Other(e.to_string()))?;
        let resolved_slug = conv.slug.clone().unwrap_or_else(|| input.slug.clone());
        let renamed = resolved_slug != input.slug;

        let handle = self.get_or_create(&conv.id).await.map_err(ToolRuntimeError::Other)?;

        if !existed {
            self.bus.publish(&conv.id, BusEvent::conversation_created(conv.clone()));
        }

        let is_idle = !existed || conv.state == crate::db::ConversationState::Idle;
        if is_idle {
            let message_id = uuid::Uuid::new_v4().to_string();
            self.send_event(&conv.id, Event::UserMessage { text: input.prompt, images: vec![], message_id })
                .await
                .map_err(ToolRuntimeError::Other)?;
        }

        let wait = input.wait.unwrap_or(true);
        if !wait {
            return Ok(SubagentOutcome {
                slug: resolved_slug,
                conversation_id: conv.id,
                renamed,
                status: SubagentStatus::StillWorking,
            });
        }

        let timeout = Duration::from_secs(u64::from(input.timeout_seconds.unwrap_or(60)));
        let mut rx = handle.broadcast_tx.subscribe();
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => {
                    return Ok(SubagentOutcome {
                        slug: resolved_slug,
                        conversation_id: conv.id,
                        renamed,
                        status: SubagentStatus::StillWorking,
                    });
                }
                received = rx.recv() => {
                    match received {
                        Ok(SseEvent::AgentDone) => {
                            let text = self.last_agent_text(&conv.id);
                            return Ok(SubagentOutcome {
                                slug: resolved_slug,
                                conversation_id: conv.id,
                                renamed,
                                status: SubagentStatus::Completed { text },
                            });
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Ok(SubagentOutcome {
                                slug: resolved_slug,
                                conversation_id: conv.id,
                                renamed,
                                status: SubagentStatus::StillWorking,
                            });
                        }
                    }
                }
            }
        }
    }

    fn last_agent_text(&self, conversation_id: &str) -> String {
        self.db
            .list_messages(conversation_id)
            .unwrap_or_default()
            .into_iter()
            .rev()
            .find_map(|m| match m.content {
                MessageContent::Agent { blocks } => {
                    let text: String = blocks
                        .iter()
                        .filter_map(|b| match b {
                            crate::llm::ContentBlock::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect();
                    Some(text)
                }
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// Adapts `Arc<RuntimeManager>` to the `tools`-facing [`SubagentSpawner`]
/// trait, so `tools` never depends on `runtime` directly.
struct Spawner(Arc<RuntimeManager>);

#[async_trait]
impl SubagentSpawner for Spawner {
    async fn spawn(&self, parent: &ConvContext, input: SubagentInput) -> Result<SubagentOutcome, ToolRuntimeError> {
        self.0.spawn_subagent(parent, input).await
    }
}
