use axum::http::HeaderMap;

use crate::{
    error::RequestError,
    messages::openai::{ChatCompletionRequest, ChatMessage, ChatRole, ContentPart, MessageContent},
    runtime::{ContentBlock, Role, RuntimeInput, RuntimeMessage},
};

/// Header carrying the caller's correlation id.
const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Header naming the conversation thread when the body does not.
const SESSION_ID_HEADER: &str = "X-Session-Id";

/// Per-request ambient information.
///
/// Built once when a request enters the handler and shared read-only with the
/// request converter, the runtime and the tracer.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique identifier of this run. Also the suffix of the completion id.
    pub run_id: String,

    /// Correlation id for logs, taken from `X-Request-Id` when present.
    pub log_id: String,

    /// Project the run is reported under.
    pub project_id: String,

    /// Session identifier sent as a header, used when the body has none.
    pub session_header: Option<String>,
}

impl RequestContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();

        Self {
            log_id: run_id.clone(),
            run_id,
            project_id: project_id.into(),
            session_header: None,
        }
    }

    /// Completion id reported to the client.
    pub fn request_id(&self) -> String {
        format!("chatcmpl-{}", self.run_id)
    }
}

/// Extract the request context from the incoming headers.
pub(crate) fn extract_context(headers: &HeaderMap, project_id: &str) -> RequestContext {
    let mut context = RequestContext::new(project_id);

    if let Some(log_id) = header_value(headers, REQUEST_ID_HEADER) {
        context.log_id = log_id;
    }

    context.session_header = header_value(headers, SESSION_ID_HEADER);

    context
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Validates inbound payloads and shapes them for the agent runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestConverter;

impl RequestConverter {
    /// Parse and validate a raw request body.
    pub fn parse(&self, payload: &[u8]) -> Result<ChatCompletionRequest, RequestError> {
        let request: ChatCompletionRequest =
            serde_json::from_slice(payload).map_err(|error| RequestError::Malformed(error.to_string()))?;

        if request.messages.is_empty() {
            return Err(RequestError::NoMessages);
        }

        Ok(request)
    }

    /// Derive the conversation thread of a request.
    ///
    /// The body's `session_id` wins over `metadata.session_id`, which wins over
    /// the `X-Session-Id` header. Blank values are skipped.
    pub fn get_session_id(
        &self,
        request: &ChatCompletionRequest,
        context: &RequestContext,
    ) -> Result<String, RequestError> {
        let from_metadata = request
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("session_id"))
            .and_then(|value| value.as_str());

        [
            request.session_id.as_deref(),
            from_metadata,
            context.session_header.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|session_id| !session_id.is_empty())
        .map(str::to_string)
        .ok_or(RequestError::MissingSession)
    }

    /// Map the new turn of a request to runtime input.
    ///
    /// Earlier turns live in the runtime's checkpoint store, so only system
    /// messages and the messages after the last assistant reply are forwarded.
    pub fn to_stream_input(
        &self,
        request: &ChatCompletionRequest,
        session_id: &str,
    ) -> Result<RuntimeInput, RequestError> {
        let turn_start = request
            .messages
            .iter()
            .rposition(|message| message.role == ChatRole::Assistant)
            .map_or(0, |index| index + 1);

        let messages: Vec<RuntimeMessage> = request
            .messages
            .iter()
            .enumerate()
            .filter(|(index, message)| message.role == ChatRole::System || *index >= turn_start)
            .filter_map(|(_, message)| to_runtime_message(message))
            .collect();

        let has_input = messages
            .iter()
            .any(|message| matches!(message.role, Role::User | Role::Tool));

        if !has_input {
            return Err(RequestError::NoUserMessage);
        }

        Ok(RuntimeInput {
            session_id: session_id.to_string(),
            messages,
        })
    }
}

fn to_runtime_message(message: &ChatMessage) -> Option<RuntimeMessage> {
    let content = match message.content.as_ref()? {
        MessageContent::Text(text) => vec![ContentBlock::Text(text.clone())],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(ContentBlock::Text(text.clone())),
                ContentPart::ImageUrl { image_url } => Some(ContentBlock::Image {
                    url: image_url.url.clone(),
                }),
                ContentPart::Unsupported => {
                    log::debug!("Dropping unsupported content part from {} message", message.role);
                    None
                }
            })
            .collect(),
    };

    let message = RuntimeMessage {
        role: Role::from(message.role),
        content,
        name: message.name.clone(),
        tool_call_id: message.tool_call_id.clone(),
    };

    (!message.is_blank()).then_some(message)
}
