//! OpenAI Chat Completions surface in front of an agent runtime.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Response,
    routing::{get, post},
};

mod classifier;
mod error;
mod handler;
pub mod messages;
mod request;
mod response;
pub mod runtime;
mod tracer;

pub use classifier::{ErrorContext, classify};
pub use error::{ClassifiedError, ErrorCategory, RequestError};
pub use handler::{ChatHandler, RECURSION_LIMIT};
pub use request::{RequestContext, RequestConverter};
pub use response::{DONE_FRAME, FrameStream, ResponseConverter};
pub use runtime::{AgentRuntime, RunConfig, RuntimeError, RuntimeEvent, RuntimeEventStream, RuntimeInput, TraceMode};
pub use tracer::{LogTracer, RunInfo, RunOutcome, RunTracer};

use messages::openai::ModelsResponse;

/// Creates the axum router for the chat completions endpoints.
pub fn router(config: &config::ChatConfig, handler: ChatHandler) -> Router {
    let routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .with_state(handler);

    // Nesting at the root is not allowed by axum.
    if config.path == "/" {
        Router::new().merge(routes)
    } else {
        Router::new().nest(&config.path, routes)
    }
}

/// Builds the runtime selected in the configuration.
pub fn runtime_from_config(config: &config::RuntimeConfig) -> Result<Arc<dyn AgentRuntime>, RuntimeError> {
    match config {
        config::RuntimeConfig::Openai(config) => Ok(Arc::new(runtime::OpenAiRuntime::new(config)?)),
    }
}

/// Project the runs of a runtime are reported under.
pub fn project_id(config: &config::RuntimeConfig) -> &str {
    match config {
        config::RuntimeConfig::Openai(config) => &config.project_id,
    }
}

/// Handle chat completion requests.
///
/// The body is read raw so that malformed payloads are reported in the OpenAI
/// error format instead of axum's rejection format.
async fn chat_completions(State(handler): State<ChatHandler>, headers: HeaderMap, body: Bytes) -> Response {
    handler.handle(&headers, &body).await
}

/// Handle list models requests.
async fn list_models(State(handler): State<ChatHandler>) -> Json<ModelsResponse> {
    let response = handler.models();

    log::debug!("Returning {} models", response.data.len());
    Json(response)
}
