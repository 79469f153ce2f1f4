//! Runtime backed by an OpenAI-compatible chat completions endpoint.
//!
//! The agent is a single model call per turn: the configured system prompt,
//! the thread's checkpointed history and the new turn are sent upstream, and
//! the streamed reply is stored back once the run completes.

use async_trait::async_trait;
use config::OpenAiRuntimeConfig;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{StreamExt, stream::BoxStream};
use reqwest::{
    Client, StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{
    AgentRuntime, ContentBlock, MemoryCheckpointer, Role, RunConfig, RuntimeError, RuntimeEvent, RuntimeEventStream,
    RuntimeInput, RuntimeMessage, http_client::default_http_client_builder,
};
use crate::{
    messages::openai::{FinishReason, Usage},
    request::RequestContext,
};

/// Read when the configuration does not carry a key.
const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub struct OpenAiRuntime {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    checkpointer: MemoryCheckpointer,
}

impl OpenAiRuntime {
    pub fn new(config: &OpenAiRuntimeConfig) -> Result<Self, RuntimeError> {
        let client = default_http_client_builder(config.timeout).build().map_err(|e| {
            log::error!("Failed to create HTTP client for the OpenAI runtime: {e}");
            RuntimeError::Internal(format!("failed to create HTTP client: {e}"))
        })?;

        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok().map(SecretString::from));

        if api_key.is_none() {
            log::warn!("No API key configured for the OpenAI runtime, upstream calls are unauthenticated");
        }

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            checkpointer: MemoryCheckpointer::new(config.max_messages),
        })
    }

    /// System prompt, checkpointed history and the new turn, in that order.
    fn upstream_messages(&self, history: &[RuntimeMessage], turn: &[RuntimeMessage]) -> Vec<UpstreamMessage> {
        let system_texts: Vec<String> = turn
            .iter()
            .filter(|message| message.role == Role::System)
            .map(RuntimeMessage::joined_text)
            .collect();

        let system_prompt = if system_texts.is_empty() {
            self.system_prompt.clone()
        } else {
            Some(system_texts.join("\n\n"))
        };

        let conversation = history
            .iter()
            .chain(turn.iter().filter(|message| message.role != Role::System))
            .map(UpstreamMessage::from);

        system_prompt
            .map(|prompt| UpstreamMessage {
                role: "system",
                content: UpstreamContent::Text(prompt),
                name: None,
            })
            .into_iter()
            .chain(conversation)
            .collect()
    }
}

#[async_trait]
impl AgentRuntime for OpenAiRuntime {
    async fn stream_events(
        &self,
        input: RuntimeInput,
        config: RunConfig,
        context: &RequestContext,
    ) -> Result<RuntimeEventStream, RuntimeError> {
        // One upstream model call is one step of the run.
        if config.recursion_limit == 0 {
            return Err(RuntimeError::RecursionLimit(config.recursion_limit));
        }

        let history = self.checkpointer.history(&config.thread_id);
        let messages = self.upstream_messages(&history, &input.messages);

        log::debug!(
            "Calling upstream model {} for thread {} with {} messages ({} from history)",
            self.model,
            config.thread_id,
            messages.len(),
            history.len()
        );

        let body = UpstreamRequest {
            model: &self.model,
            messages,
            stream: true,
            stream_options: UpstreamStreamOptions { include_usage: true },
            temperature: self.temperature,
        };

        let body = sonic_rs::to_vec(&body)
            .map_err(|e| RuntimeError::Internal(format!("failed to serialize upstream request: {e}")))?;

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .header("X-Request-Id", context.log_id.as_str())
            .body(body);

        if let Some(api_key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", api_key.expose_secret()));
        }

        let response = tokio::select! {
            biased;
            _ = config.cancellation.cancelled() => return Err(RuntimeError::Cancelled),
            response = request.send() => response.map_err(transport_error)?,
        };

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Upstream model error ({status}): {error_text}");

            return Err(status_error(status, error_text));
        }

        let state = UpstreamState {
            events: response.bytes_stream().eventsource().boxed(),
            message_id: format!("msg-{}", context.run_id),
            reply: String::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
            done: false,
            checkpointer: self.checkpointer.clone(),
            thread_id: config.thread_id.clone(),
            turn: input.messages,
        };

        let events = futures::stream::unfold(state, |mut state| async move {
            let item = state.next_event().await?;
            Some((item, state))
        });

        Ok(events.take_until(config.cancellation.cancelled_owned()).boxed())
    }

    fn models(&self) -> Vec<String> {
        vec![self.model.clone()]
    }

    fn name(&self) -> &str {
        "openai"
    }
}

type UpstreamEvents = BoxStream<'static, Result<eventsource_stream::Event, EventStreamError<reqwest::Error>>>;

struct UpstreamState {
    events: UpstreamEvents,
    message_id: String,
    reply: String,
    finish_reason: FinishReason,
    usage: Option<Usage>,
    done: bool,
    checkpointer: MemoryCheckpointer,
    thread_id: String,
    turn: Vec<RuntimeMessage>,
}

impl UpstreamState {
    async fn next_event(&mut self) -> Option<Result<RuntimeEvent, RuntimeError>> {
        while !self.done {
            let event = match self.events.next().await {
                Some(Ok(event)) if event.data == "[DONE]" => return Some(Ok(self.finish())),
                None => return Some(Ok(self.finish())),
                Some(Ok(event)) => event,
                Some(Err(EventStreamError::Transport(e))) => {
                    log::error!("Upstream stream transport failed: {e}");
                    return Some(Err(self.fail(transport_error(e))));
                }
                Some(Err(e)) => {
                    log::error!("Malformed upstream event stream: {e}");
                    return Some(Err(self.fail(RuntimeError::Internal(format!("malformed event stream: {e}")))));
                }
            };

            let Ok(chunk) = sonic_rs::from_str::<UpstreamChunk>(&event.data) else {
                log::warn!("Failed to parse upstream streaming chunk");
                continue;
            };

            if let Some(error) = chunk.error {
                return Some(Err(self.fail(RuntimeError::Upstream {
                    status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    message: error.message,
                })));
            }

            if let Some(usage) = chunk.usage {
                self.usage = Some(usage);
            }

            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };

            if let Some(reason) = choice.finish_reason.as_deref() {
                self.finish_reason = finish_reason(reason);
            }

            if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                self.reply.push_str(&text);
                return Some(Ok(RuntimeEvent::delta(self.message_id.clone(), text)));
            }
        }

        None
    }

    /// Store the completed turn and emit the terminal event.
    fn finish(&mut self) -> RuntimeEvent {
        self.done = true;

        let reply = RuntimeMessage::text(Role::Assistant, std::mem::take(&mut self.reply));
        let turn = std::mem::take(&mut self.turn);
        self.checkpointer.append(&self.thread_id, turn.into_iter().chain([reply]));

        RuntimeEvent::Finished {
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }

    fn fail(&mut self, error: RuntimeError) -> RuntimeError {
        self.done = true;
        error
    }
}

fn transport_error(error: reqwest::Error) -> RuntimeError {
    if error.is_timeout() {
        RuntimeError::Timeout(error.to_string())
    } else {
        RuntimeError::Http(error)
    }
}

fn status_error(status: StatusCode, message: String) -> RuntimeError {
    match status.as_u16() {
        404 => RuntimeError::NotFound(message),
        408 | 504 => RuntimeError::Timeout(message),
        400 | 422 => RuntimeError::InvalidInput(message),
        status => RuntimeError::Upstream { status, message },
    }
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[derive(Debug, Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    messages: Vec<UpstreamMessage>,
    stream: bool,
    stream_options: UpstreamStreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct UpstreamStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct UpstreamMessage {
    role: &'static str,
    content: UpstreamContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl From<&RuntimeMessage> for UpstreamMessage {
    fn from(message: &RuntimeMessage) -> Self {
        // Tool output arrives without the assistant tool call that produced
        // it, which the upstream API would reject as a `tool` message.
        let role = match message.role {
            Role::System => "system",
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        };

        let has_images = message
            .content
            .iter()
            .any(|block| matches!(block, ContentBlock::Image { .. }));

        let content = if has_images {
            let parts = message
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text(text) => UpstreamPart::Text { text: text.clone() },
                    ContentBlock::Image { url } => UpstreamPart::ImageUrl {
                        image_url: UpstreamImageUrl { url: url.clone() },
                    },
                })
                .collect();

            UpstreamContent::Parts(parts)
        } else {
            UpstreamContent::Text(message.joined_text())
        };

        Self {
            role,
            content,
            name: message.name.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum UpstreamContent {
    Text(String),
    Parts(Vec<UpstreamPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UpstreamPart {
    Text { text: String },
    ImageUrl { image_url: UpstreamImageUrl },
}

#[derive(Debug, Serialize)]
struct UpstreamImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<UpstreamError>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    delta: UpstreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamError {
    message: String,
}
