//! Tool implementations for Shelley's conversation engine.
//!
//! Tools are stateless singletons; all per-call context (cancellation,
//! working directory, depth/model for subagent gating, browser sessions,
//! the LLM registry) is injected fresh via `ToolContext` on every call.

mod bash;
pub mod bash_check;
pub mod browser;
mod change_dir;
mod iframe_output;
pub mod image_util;
mod keyword_search;
pub mod patch;
mod read_image;
mod subagent;

pub use bash::BashTool;
pub use browser::{
    BrowserClearConsoleLogsTool, BrowserError, BrowserEvalTool, BrowserNavigateTool,
    BrowserRecentConsoleLogsTool, BrowserResizeTool, BrowserSessionManager,
    BrowserTakeScreenshotTool,
};
pub use change_dir::ChangeDirTool;
pub use iframe_output::IframeOutputTool;
pub use keyword_search::KeywordSearchTool;
pub use patch::PatchTool;
pub use read_image::ReadImageTool;
pub use subagent::SubagentTool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::ToolRuntimeError;
use crate::llm::ModelRegistry;
use crate::state_machine::state::{ConvContext, SubagentInput};
pub use browser::session::BrowserSession;

/// Result from tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
    /// Set when the tool changed the conversation's working directory
    /// (currently only `bash`, via a `cd`/`pushd`/`popd` in the command).
    /// The executor applies this to the conversation's `MutableWorkingDir`
    /// after the tool returns (turn algorithm step h).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd_change: Option<PathBuf>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            display_data: None,
            cwd_change: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            display_data: None,
            cwd_change: None,
        }
    }

    pub fn with_display(mut self, data: Value) -> Self {
        self.display_data = Some(data);
        self
    }

    pub fn with_cwd_change(mut self, dir: PathBuf) -> Self {
        self.cwd_change = Some(dir);
        self
    }
}

/// Outcome of a `subagent` tool call, reported back to the caller so it can
/// decide whether to keep polling (`wait: true`, still working) or move on.
#[derive(Debug, Clone)]
pub enum SubagentStatus {
    /// The child conversation reached `Idle` within the requested timeout.
    /// `text` is the concatenation of its final assistant text, if any.
    Completed { text: String },
    /// `wait: false`, or `wait: true` but the timeout elapsed first. The
    /// child keeps running; it is never cancelled by a timeout.
    StillWorking,
}

/// Result of resolving/spawning a subagent conversation.
#[derive(Debug, Clone)]
pub struct SubagentOutcome {
    pub slug: String,
    pub conversation_id: String,
    /// True if the resolved slug differs from the one the model asked for
    /// (uniqueness suffixing kicked in).
    pub renamed: bool,
    pub status: SubagentStatus,
}

/// Lets the `subagent` tool reach into conversation orchestration (creating
/// or resuming a child conversation, running or awaiting its turn) without
/// `tools` depending on `runtime` — `runtime::RuntimeManager` implements
/// this and is injected into `ToolContext` per call.
#[async_trait]
pub trait SubagentSpawner: Send + Sync {
    async fn spawn(
        &self,
        parent: &ConvContext,
        input: SubagentInput,
    ) -> Result<SubagentOutcome, ToolRuntimeError>;
}

/// A `SubagentSpawner` for contexts with no orchestrator attached (tests,
/// and tool calls made from a conversation where `subagent_tool_allowed()`
/// is false, so the tool is never actually registered).
pub struct NoSubagentSpawner;

#[async_trait]
impl SubagentSpawner for NoSubagentSpawner {
    async fn spawn(
        &self,
        _parent: &ConvContext,
        _input: SubagentInput,
    ) -> Result<SubagentOutcome, ToolRuntimeError> {
        Err(ToolRuntimeError::Other(
            "subagent spawning is not available in this context".to_string(),
        ))
    }
}

/// All context needed for a single tool invocation. Built fresh per call.
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations.
    pub cancel: CancellationToken,

    /// The conversation this tool is executing within.
    pub conversation_id: String,

    /// Working directory for file operations.
    pub working_dir: PathBuf,

    /// Full conversation context (depth, parent, model) for tools that
    /// need more than just cwd/conversation_id — currently only `subagent`.
    pub conv_ctx: ConvContext,

    /// Browser session manager (access via `browser()` method).
    browser_sessions: Arc<BrowserSessionManager>,

    /// LLM registry for tools that need model access.
    llm_registry: Arc<ModelRegistry>,

    /// Orchestration hook for the `subagent` tool.
    subagents: Arc<dyn SubagentSpawner>,
}

impl ToolContext {
    /// Create a new tool context with a synthetic, depth-0 `ConvContext`
    /// and no subagent spawner. Production call sites should follow up
    /// with [`ToolContext::with_conv_context`]; this constructor alone is
    /// enough for tools that don't touch subagent orchestration.
    pub fn new(
        cancel: CancellationToken,
        conversation_id: String,
        working_dir: PathBuf,
        browser_sessions: Arc<BrowserSessionManager>,
        llm_registry: Arc<ModelRegistry>,
    ) -> Self {
        let conv_ctx = ConvContext::new(conversation_id.clone(), working_dir.clone(), None);
        Self {
            cancel,
            conversation_id,
            working_dir,
            conv_ctx,
            browser_sessions,
            llm_registry,
            subagents: Arc::new(NoSubagentSpawner),
        }
    }

    /// Attach the real conversation context and subagent spawner. Used by
    /// the runtime when dispatching a tool call for a live conversation.
    pub fn with_conv_context(
        mut self,
        conv_ctx: ConvContext,
        subagents: Arc<dyn SubagentSpawner>,
    ) -> Self {
        self.conv_ctx = conv_ctx;
        self.subagents = subagents;
        self
    }

    /// Get or create the browser session for this conversation. Lazily
    /// initializes Chrome on first call; subsequent calls reuse it.
    pub async fn browser(&self) -> Result<Arc<RwLock<BrowserSession>>, BrowserError> {
        self.browser_sessions
            .get_session(&self.conversation_id)
            .await
    }

    pub fn llm_registry(&self) -> &Arc<ModelRegistry> {
        &self.llm_registry
    }

    /// Max image dimension advertised by the conversation's current model
    /// (or the registry default), for resizing screenshots/`read_image`
    /// output before it goes back to the model.
    pub fn max_image_dimension(&self) -> Option<u32> {
        let model_id = self.conv_ctx.model.as_deref();
        let service = model_id
            .and_then(|id| self.llm_registry.get(id))
            .or_else(|| self.llm_registry.default())?;
        service.max_image_dimension()
    }

    pub fn subagents(&self) -> &Arc<dyn SubagentSpawner> {
        &self.subagents
    }
}

/// A tool the model can call. All context flows in through `ToolContext`;
/// implementors hold no per-conversation state.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String;

    fn input_schema(&self) -> Value;

    /// Tools that spawn long-running subprocesses should monitor
    /// `ctx.cancel` and terminate gracefully when cancelled.
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// The set of tools available to a conversation. Built once per engine and
/// shared; `subagent` inclusion is computed per-conversation by the caller
/// via [`ToolRegistry::for_context`].
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Build the registry appropriate for `ctx`: the full tool set, plus
    /// `subagent` only if `ctx.subagent_tool_allowed()`. Assumes the active
    /// model supports screenshots; callers that know better should use
    /// [`ToolRegistry::for_context_with_capabilities`].
    pub fn for_context(ctx: &ConvContext) -> Self {
        Self::for_context_with_capabilities(ctx, true)
    }

    /// Build the registry for `ctx`, dropping `browser_take_screenshot`
    /// when the conversation's model doesn't advertise screenshot support.
    pub fn for_context_with_capabilities(ctx: &ConvContext, screenshots_supported: bool) -> Self {
        let mut tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(BashTool),
            Arc::new(PatchTool::default()),
            Arc::new(KeywordSearchTool),
            Arc::new(ChangeDirTool),
            Arc::new(IframeOutputTool),
            Arc::new(ReadImageTool),
            Arc::new(BrowserNavigateTool),
            Arc::new(BrowserEvalTool),
            Arc::new(BrowserResizeTool),
            Arc::new(BrowserRecentConsoleLogsTool),
            Arc::new(BrowserClearConsoleLogsTool),
        ];

        if screenshots_supported {
            tools.push(Arc::new(BrowserTakeScreenshotTool));
        }

        if ctx.subagent_tool_allowed() {
            tools.push(Arc::new(SubagentTool));
        }

        Self { tools }
    }

    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, ctx).await);
            }
        }
        None
    }
}
