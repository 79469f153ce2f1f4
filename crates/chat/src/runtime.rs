//! Contract between the gateway and the agent runtime executing a turn.
//!
//! The runtime is an external collaborator: it owns the reasoning loop, tool
//! execution, model calls and the per-thread checkpoint store. The gateway only
//! hands it a [`RuntimeInput`] with a [`RunConfig`] and consumes the resulting
//! [`RuntimeEventStream`].

mod checkpoint;
mod http_client;
pub mod openai;

pub use checkpoint::MemoryCheckpointer;
pub use openai::OpenAiRuntime;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    messages::openai::{ChatRole, FinishReason, Usage},
    request::RequestContext,
    tracer::RunTracer,
};

/// Lazy, finite sequence of events produced by one runtime invocation.
pub type RuntimeEventStream = BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;

/// An agent runtime able to execute one conversational turn.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Starts a run and returns its event stream.
    ///
    /// Implementations must stop producing events once `config.cancellation`
    /// is cancelled.
    async fn stream_events(
        &self,
        input: RuntimeInput,
        config: RunConfig,
        context: &RequestContext,
    ) -> Result<RuntimeEventStream, RuntimeError>;

    /// Model identifiers advertised on `/v1/models`.
    fn models(&self) -> Vec<String> {
        Vec::new()
    }

    /// Name of the runtime, reported as the model owner.
    fn name(&self) -> &str;
}

/// Normalized input for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeInput {
    pub session_id: String,
    pub messages: Vec<RuntimeMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl From<ChatRole> for Role {
    fn from(role: ChatRole) -> Self {
        match role {
            ChatRole::System => Role::System,
            ChatRole::User => Role::User,
            ChatRole::Assistant => Role::Assistant,
            ChatRole::Tool => Role::Tool,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub name: Option<String>,
    pub tool_call_id: Option<String>,
}

impl RuntimeMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text(text.into())],
            name: None,
            tool_call_id: None,
        }
    }

    /// All text blocks joined by newlines.
    pub fn joined_text(&self) -> String {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.as_str()),
                ContentBlock::Image { .. } => None,
            })
            .collect();

        texts.join("\n")
    }

    pub fn is_blank(&self) -> bool {
        self.content.iter().all(|block| match block {
            ContentBlock::Text(text) => text.trim().is_empty(),
            ContentBlock::Image { .. } => false,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Image { url: String },
}

/// One unit of runtime output.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Incremental assistant text.
    MessageDelta { message_id: String, text: String },
    /// The agent decided to call one of its tools.
    ToolCall {
        message_id: String,
        call_id: String,
        name: String,
        arguments: String,
    },
    /// A tool finished and its output was fed back to the agent.
    ToolResult {
        message_id: String,
        call_id: String,
        output: String,
    },
    /// The run is over.
    Finished {
        finish_reason: FinishReason,
        usage: Option<Usage>,
    },
}

impl RuntimeEvent {
    pub fn delta(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::MessageDelta {
            message_id: message_id.into(),
            text: text.into(),
        }
    }

    pub fn finished(finish_reason: FinishReason) -> Self {
        Self::Finished {
            finish_reason,
            usage: None,
        }
    }

    pub fn text_delta(&self) -> Option<&str> {
        match self {
            Self::MessageDelta { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::MessageDelta { message_id, .. }
            | Self::ToolCall { message_id, .. }
            | Self::ToolResult { message_id, .. } => Some(message_id),
            Self::Finished { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// Whether the run's output is relayed incrementally or buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Streaming,
    Buffered,
}

impl TraceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Buffered => "buffered",
        }
    }
}

/// Immutable per-run configuration handed to the runtime.
#[derive(Clone)]
pub struct RunConfig {
    /// Ceiling on internal runtime steps for this run.
    pub recursion_limit: u32,
    /// Thread identifier locating the session's checkpoints.
    pub thread_id: String,
    pub trace_mode: TraceMode,
    pub tracer: Option<Arc<dyn RunTracer>>,
    /// Cancelled when the client goes away or the server shuts down.
    pub cancellation: CancellationToken,
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("recursion_limit", &self.recursion_limit)
            .field("thread_id", &self.thread_id)
            .field("trace_mode", &self.trace_mode)
            .field("tracer", &self.tracer.is_some())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

/// Failures raised by a runtime, either on start or mid-stream.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Recursion limit of {0} reached without hitting a stop condition")]
    RecursionLimit(u32),

    #[error("Runtime timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    NotFound(String),

    /// The runtime rejected its input.
    #[error("Invalid runtime input: {0}")]
    InvalidInput(String),

    /// The model behind the runtime answered with an error.
    #[error("Upstream model error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The run was cancelled before it could complete.
    #[error("Run cancelled")]
    Cancelled,

    #[error("Runtime failure: {0}")]
    Internal(String),
}
