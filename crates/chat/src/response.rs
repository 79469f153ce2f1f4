//! Conversion of runtime events into OpenAI responses.

use std::collections::VecDeque;

use futures::{StreamExt, stream::BoxStream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    classifier::{self, ErrorContext},
    error::ClassifiedError,
    messages::openai::{
        AssistantMessage, ChatChoice, ChatChoiceDelta, ChatCompletionChunk, ChatCompletionErrorChunk,
        ChatCompletionResponse, ChatMessageDelta, ChatRole, FinishReason, ObjectType, Usage,
    },
    runtime::{RuntimeEvent, RuntimeEventStream},
};

/// Last frame of every stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Wire-framed SSE chunks, each one ending with a blank line.
pub type FrameStream = BoxStream<'static, String>;

const STREAM_NODE: ErrorContext = ErrorContext::new("openai_stream");

/// Sent if a frame cannot be serialized, which would be a bug in the wire types.
const SERIALIZATION_FAILED: &str =
    r#"{"error":{"message":"Failed to serialize chunk","type":"internal_error","code":"500000"}}"#;

/// Shapes runtime events as OpenAI chunks or as one aggregated response.
///
/// Identity fields are fixed at construction so every frame of a response
/// carries the same id, model and creation time.
#[derive(Debug, Clone)]
pub struct ResponseConverter {
    request_id: String,
    model: String,
    created: u64,
    include_usage: bool,
}

impl ResponseConverter {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        let created = u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or_default();

        Self {
            request_id: request_id.into(),
            model: model.into(),
            created,
            include_usage: false,
        }
    }

    pub fn with_created(mut self, created: u64) -> Self {
        self.created = created;
        self
    }

    /// Report usage on the final chunk of a stream.
    pub fn with_usage(mut self, include_usage: bool) -> Self {
        self.include_usage = include_usage;
        self
    }

    /// Frame carrying one text delta.
    pub fn delta_frame(&self, text: &str, with_role: bool) -> String {
        let delta = ChatMessageDelta {
            role: with_role.then_some(ChatRole::Assistant),
            content: Some(text.to_string()),
        };

        frame(&self.chunk(delta, None, None))
    }

    /// Frame closing the choice.
    pub fn finish_frame(&self, finish_reason: FinishReason, usage: Option<Usage>) -> String {
        let usage = if self.include_usage { usage } else { None };

        frame(&self.chunk(ChatMessageDelta::default(), Some(finish_reason), usage))
    }

    /// Chunk-shaped frame carrying an error.
    pub fn error_frame(&self, error: ClassifiedError) -> String {
        let chunk = ChatCompletionErrorChunk {
            id: self.request_id.clone(),
            object: ObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            error: error.into_details(),
        };

        frame(&chunk)
    }

    /// Turn a runtime event stream into SSE frames.
    ///
    /// The returned stream always ends with exactly one [`DONE_FRAME`], unless
    /// `cancellation` fires, in which case it ends right away and writes
    /// nothing more.
    pub fn iter_stream(&self, events: RuntimeEventStream, cancellation: CancellationToken) -> FrameStream {
        let state = FrameState {
            converter: self.clone(),
            events,
            cancellation,
            pending: VecDeque::new(),
            role_sent: false,
            finished: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.cancellation.is_cancelled() {
                    log::debug!("Stream {} cancelled, no more frames", state.converter.request_id);
                    return None;
                }

                if let Some(frame) = state.pending.pop_front() {
                    return Some((frame, state));
                }

                if state.finished {
                    return None;
                }

                let next = tokio::select! {
                    biased;
                    _ = state.cancellation.cancelled() => continue,
                    next = state.events.next() => next,
                };

                match next {
                    Some(Ok(event)) => state.push_event(event),
                    Some(Err(error)) => {
                        log::error!("Runtime stream failed: {error}");

                        let classified = classifier::classify(&error, STREAM_NODE);
                        let frame = state.converter.error_frame(classified);

                        state.close(frame);
                    }
                    None => {
                        log::debug!("Runtime stream ended without a terminal event");

                        let frame = state.converter.finish_frame(FinishReason::Stop, None);
                        state.close(frame);
                    }
                }
            }
        })
        .boxed()
    }

    /// Aggregate a complete event sequence into one response.
    ///
    /// Events after the terminal event are ignored. Without a terminal event
    /// the response finishes with `stop`.
    pub fn collect(&self, events: impl IntoIterator<Item = RuntimeEvent>) -> ChatCompletionResponse {
        let mut content = String::new();
        let mut finish_reason = FinishReason::Stop;
        let mut usage = None;

        for event in events {
            match event {
                RuntimeEvent::MessageDelta { text, .. } => content.push_str(&text),
                RuntimeEvent::Finished {
                    finish_reason: reason,
                    usage: reported,
                } => {
                    finish_reason = reason;
                    usage = reported;
                    break;
                }
                RuntimeEvent::ToolCall { .. } | RuntimeEvent::ToolResult { .. } => {}
            }
        }

        ChatCompletionResponse {
            id: self.request_id.clone(),
            object: ObjectType::ChatCompletion,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: ChatRole::Assistant,
                    content,
                },
                finish_reason,
            }],
            usage,
        }
    }

    fn chunk(
        &self,
        delta: ChatMessageDelta,
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.request_id.clone(),
            object: ObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChoiceDelta {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

struct FrameState {
    converter: ResponseConverter,
    events: RuntimeEventStream,
    cancellation: CancellationToken,
    pending: VecDeque<String>,
    role_sent: bool,
    finished: bool,
}

impl FrameState {
    fn push_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::MessageDelta { text, .. } => {
                if text.is_empty() {
                    return;
                }

                let frame = self.converter.delta_frame(&text, !self.role_sent);
                self.role_sent = true;
                self.pending.push_back(frame);
            }
            RuntimeEvent::ToolCall { name, call_id, .. } => {
                log::debug!("Runtime called tool {name} ({call_id})");
            }
            RuntimeEvent::ToolResult { call_id, .. } => {
                log::debug!("Runtime received result of tool call {call_id}");
            }
            RuntimeEvent::Finished { finish_reason, usage } => {
                let frame = self.converter.finish_frame(finish_reason, usage);
                self.close(frame);
            }
        }
    }

    fn close(&mut self, last_frame: String) {
        self.pending.push_back(last_frame);
        self.pending.push_back(DONE_FRAME.to_string());
        self.finished = true;
    }
}

fn frame(payload: &impl Serialize) -> String {
    let json = sonic_rs::to_string(payload).unwrap_or_else(|e| {
        log::error!("Failed to serialize chunk: {e}");
        SERIALIZATION_FAILED.to_string()
    });

    format!("data: {json}\n\n")
}
