//! Persisted entity types shared by the store and the engine.

use crate::llm::{ContentBlock, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A conversation: the unit of fan-out, subscription, and agent-loop state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub slug: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub cwd: String,
    pub model: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    pub user_initiated: bool,
    pub state: ConversationState,
    pub state_data: Option<Value>,
    pub state_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_agent_working(&self) -> bool {
        matches!(self.state, ConversationState::Working)
    }

    pub fn is_subagent(&self) -> bool {
        self.parent_conversation_id.is_some()
    }
}

/// Top-level conversation state. `Working` spans an entire turn loop;
/// everything in between (awaiting the LLM, running tools) is internal
/// engine bookkeeping, not a distinct persisted state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Working,
    Errored,
    Cancelled,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationState::Idle => write!(f, "idle"),
            ConversationState::Working => write!(f, "working"),
            ConversationState::Errored => write!(f, "errored"),
            ConversationState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ConversationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "errored" => Ok(Self::Errored),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown conversation state: {other}")),
        }
    }
}

/// A single persisted message. `sequence_id` is dense and strictly
/// increasing per `conversation_id`, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sequence_id: i64,
    pub content: MessageContent,
    pub display_data: Option<Value>,
    pub usage_data: Option<UsageData>,
    pub excluded_from_context: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.content.message_type()
    }
}

/// Discriminant stored alongside `content` so queries can filter by kind
/// without deserializing the JSON body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Agent,
    Tool,
    System,
    Error,
    GitInfo,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::User => "user",
            MessageType::Agent => "agent",
            MessageType::Tool => "tool",
            MessageType::System => "system",
            MessageType::Error => "error",
            MessageType::GitInfo => "gitinfo",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "tool" => Ok(Self::Tool),
            "system" => Ok(Self::System),
            "error" => Ok(Self::Error),
            "gitinfo" => Ok(Self::GitInfo),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// The model-facing and user-facing payload of a message. Serialized as
/// the `content` column; `message_type()` derives the redundant
/// `message_type` column so list/filter queries stay cheap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    User(UserContent),
    Agent { blocks: Vec<ContentBlock> },
    Tool(ToolContent),
    System { text: String },
    Error { text: String },
    GitInfo(GitInfoContent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserContent {
    pub text: String,
    #[serde(default)]
    pub images: Vec<ImageData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolContent {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitInfoContent {
    pub head_sha: Option<String>,
    pub dirty: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageData {
    pub media_type: String,
    pub data: String,
}

impl MessageContent {
    pub fn user(text: impl Into<String>) -> Self {
        MessageContent::User(UserContent {
            text: text.into(),
            images: Vec::new(),
        })
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<ImageData>) -> Self {
        MessageContent::User(UserContent {
            text: text.into(),
            images,
        })
    }

    pub fn agent(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Agent { blocks }
    }

    pub fn tool(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        MessageContent::Tool(ToolContent {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        })
    }

    pub fn system(text: impl Into<String>) -> Self {
        MessageContent::System { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        MessageContent::Error { text: text.into() }
    }

    pub fn gitinfo(head_sha: Option<String>, dirty: bool, summary: impl Into<String>) -> Self {
        MessageContent::GitInfo(GitInfoContent {
            head_sha,
            dirty,
            summary: summary.into(),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessageContent::User(_) => MessageType::User,
            MessageContent::Agent { .. } => MessageType::Agent,
            MessageContent::Tool(_) => MessageType::Tool,
            MessageContent::System { .. } => MessageType::System,
            MessageContent::Error { .. } => MessageType::Error,
            MessageContent::GitInfo(_) => MessageType::GitInfo,
        }
    }

    /// `gitinfo` messages are rendered in the UI but never sent to the
    /// model; everything else participates in context.
    pub fn default_excluded_from_context(&self) -> bool {
        matches!(self, MessageContent::GitInfo(_))
    }

    /// The blocks a [`ContentBlock`]-shaped LLM message needs for this
    /// message, or `None` if this message type has no LLM-facing form
    /// (e.g. `gitinfo`, which is UI-only).
    pub fn as_llm_blocks(&self) -> Option<(crate::llm::MessageRole, Vec<ContentBlock>)> {
        use crate::llm::MessageRole;
        match self {
            MessageContent::User(u) => {
                let mut blocks = vec![ContentBlock::text(&u.text)];
                for image in &u.images {
                    blocks.push(ContentBlock::Image {
                        source: crate::llm::ImageSource::Base64 {
                            media_type: image.media_type.clone(),
                            data: image.data.clone(),
                        },
                    });
                }
                Some((MessageRole::User, blocks))
            }
            MessageContent::Agent { blocks } => Some((MessageRole::Assistant, blocks.clone())),
            MessageContent::Tool(t) => Some((
                MessageRole::User,
                vec![ContentBlock::tool_result(&t.tool_use_id, &t.content, t.is_error)],
            )),
            MessageContent::System { .. } | MessageContent::Error { .. } | MessageContent::GitInfo(_) => None,
        }
    }
}

/// Token usage attached to an assistant message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl UsageData {
    pub fn context_window_used(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

impl From<Usage> for UsageData {
    fn from(u: Usage) -> Self {
        Self {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_creation_tokens: u.cache_creation_tokens,
            cache_read_tokens: u.cache_read_tokens,
        }
    }
}

/// Error classification, surfaced to the UI so it can render an
/// appropriate hint (re-auth, back off, etc).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    RateLimit,
    Network,
    InvalidRequest,
    Unknown,
}

impl From<crate::llm::LlmErrorKind> for ErrorKind {
    fn from(k: crate::llm::LlmErrorKind) -> Self {
        use crate::llm::LlmErrorKind as K;
        match k {
            K::Auth => ErrorKind::Auth,
            K::RateLimit => ErrorKind::RateLimit,
            K::Network | K::ServerError => ErrorKind::Network,
            K::InvalidRequest => ErrorKind::InvalidRequest,
            K::Unknown => ErrorKind::Unknown,
        }
    }
}

/// A stored LLM request/response pair. `request_body` may be only the
/// suffix that extends `prefix_request_id`'s reconstructed body; see
/// [`super::Database::get_full_llm_request_body`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequestRecord {
    pub id: String,
    pub conversation_id: Option<String>,
    pub request_body: String,
    pub response_body: Option<String>,
    pub prefix_request_id: Option<String>,
    pub prefix_length: i64,
    pub created_at: DateTime<Utc>,
}

/// An available model configuration, for UI listing and capability
/// checks (e.g. whether to register the screenshot tools).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    pub display_name: String,
    pub provider: String,
    pub capabilities: Value,
    pub created_at: DateTime<Utc>,
}

impl ModelRecord {
    pub fn supports_screenshots(&self) -> bool {
        self.capabilities
            .get("screenshots")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
