//! Streaming fan-out: per-conversation publish/subscribe delivering
//! incremental deltas to every connected client, plus visibility at the
//! parent conversation's stream when a child changes.

use crate::db::{Conversation, ConversationState, Message};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Bounded per-subscriber queue size; overflow drops the connection and
/// the client resynchronizes from `lastSequenceSeen`.
const SUBSCRIBER_QUEUE_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    MessageAppended {
        conversation_id: String,
        message: Message,
    },
    ConversationState {
        conversation_id: String,
        working: bool,
        model: Option<String>,
    },
    ConversationListUpdate {
        update_type: ConversationListUpdateType,
        conversation: Option<Conversation>,
        conversation_id: Option<String>,
    },
    Heartbeat,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationListUpdateType {
    Created,
    Updated,
    Deleted,
    Archived,
    Pinned,
}

impl BusEvent {
    pub fn conversation_state(conversation_id: impl Into<String>, working: bool, model: Option<String>) -> Self {
        BusEvent::ConversationState {
            conversation_id: conversation_id.into(),
            working,
            model,
        }
    }

    pub fn message_appended(conversation_id: impl Into<String>, message: Message) -> Self {
        BusEvent::MessageAppended {
            conversation_id: conversation_id.into(),
            message,
        }
    }

    pub fn conversation_created(conversation: Conversation) -> Self {
        BusEvent::ConversationListUpdate {
            update_type: ConversationListUpdateType::Created,
            conversation: Some(conversation),
            conversation_id: None,
        }
    }

    pub fn conversation_updated(conversation: Conversation) -> Self {
        BusEvent::ConversationListUpdate {
            update_type: ConversationListUpdateType::Updated,
            conversation: Some(conversation),
            conversation_id: None,
        }
    }

    pub fn conversation_list_update(
        update_type: ConversationListUpdateType,
        conversation_id: impl Into<String>,
    ) -> Self {
        BusEvent::ConversationListUpdate {
            update_type,
            conversation: None,
            conversation_id: Some(conversation_id.into()),
        }
    }
}

/// One subscriber's broadcast handle plus the `(conversationId,
/// lastSequenceSeen)` identity a reconnect resumes from.
pub struct Subscription {
    pub conversation_id: String,
    pub last_sequence_seen: i64,
    pub receiver: broadcast::Receiver<BusEvent>,
}

struct ConversationChannel {
    sender: broadcast::Sender<BusEvent>,
    parent_conversation_id: Option<String>,
}

/// Per-conversation and global fan-out. A `publish` to a conversation id
/// is also delivered to that conversation's parent (if any) so a
/// parent's stream observes a child's creation/state changes.
pub struct EventBus {
    channels: Mutex<HashMap<String, ConversationChannel>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, conversation_id: &str, parent_conversation_id: Option<String>) {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        channels.entry(conversation_id.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(SUBSCRIBER_QUEUE_SIZE);
            ConversationChannel {
                sender,
                parent_conversation_id,
            }
        });
    }

    pub fn subscribe(&self, conversation_id: &str, last_sequence_seen: i64) -> Subscription {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        let channel = channels.entry(conversation_id.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(SUBSCRIBER_QUEUE_SIZE);
            ConversationChannel {
                sender,
                parent_conversation_id: None,
            }
        });
        Subscription {
            conversation_id: conversation_id.to_string(),
            last_sequence_seen,
            receiver: channel.sender.subscribe(),
        }
    }

    /// Publishes to `conversation_id`'s own subscribers and, if it has a
    /// registered parent, to the parent's subscribers too — so a parent's
    /// stream sees its subagent's creation and state changes.
    pub fn publish(&self, conversation_id: &str, event: BusEvent) {
        let channels = self.channels.lock().expect("bus lock poisoned");
        if let Some(channel) = channels.get(conversation_id) {
            let _ = channel.sender.send(event.clone());
            if let Some(parent_id) = &channel.parent_conversation_id {
                if let Some(parent_channel) = channels.get(parent_id) {
                    let _ = parent_channel.sender.send(event);
                }
            }
        }
    }

    pub fn publish_heartbeat(&self, conversation_id: &str) {
        self.publish(conversation_id, BusEvent::Heartbeat);
    }
}
