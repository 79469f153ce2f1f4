//! Mock OpenAI upstream the gateway runtime talks to.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// How the mock answers a completion request.
#[derive(Debug, Clone)]
enum Behavior {
    Reply,
    Status { status: u16, message: String },
    MidStreamError { message: String },
}

/// Streaming OpenAI-compatible model that replies with canned chunks.
#[derive(Debug, Clone)]
pub struct OpenAIMock {
    model: String,
    chunks: Vec<String>,
    finish_reason: String,
    behavior: Behavior,
}

impl OpenAIMock {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            chunks: vec!["Hello".to_string(), " from".to_string(), " the agent".to_string()],
            finish_reason: "stop".to_string(),
            behavior: Behavior::Reply,
        }
    }

    /// Content deltas streamed before the finish chunk.
    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|chunk| chunk.to_string()).collect();
        self
    }

    pub fn with_finish_reason(mut self, finish_reason: &str) -> Self {
        self.finish_reason = finish_reason.to_string();
        self
    }

    /// Answer every request with an HTTP error instead of a stream.
    pub fn with_status(mut self, status: u16, message: &str) -> Self {
        self.behavior = Behavior::Status {
            status,
            message: message.to_string(),
        };
        self
    }

    /// Send the content chunks, then an in-band error, and close the stream.
    pub fn with_mid_stream_error(mut self, message: &str) -> Self {
        self.behavior = Behavior::MidStreamError {
            message: message.to_string(),
        };
        self
    }

    pub(crate) async fn spawn(self) -> anyhow::Result<RunningMock> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        let state = Arc::new(MockState {
            mock: self,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .with_state(state.clone());

        let shutdown = CancellationToken::new();

        tokio::spawn({
            let shutdown = shutdown.clone();

            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                    .ok();
            }
        });

        Ok(RunningMock {
            address,
            state,
            shutdown,
        })
    }
}

struct MockState {
    mock: OpenAIMock,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// A request the mock received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub body: Value,
    pub authorization: Option<String>,
    pub request_id: Option<String>,
}

/// Handle to a spawned mock.
#[derive(Clone)]
pub struct RunningMock {
    address: SocketAddr,
    state: Arc<MockState>,
    shutdown: CancellationToken,
}

impl RunningMock {
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.address)
    }

    /// Bodies and headers of every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Messages sent upstream by the n-th request.
    pub fn messages(&self, index: usize) -> Value {
        self.requests()[index].body["messages"].clone()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn config(&self) -> String {
        indoc::formatdoc! {r#"

            [chat.runtime]
            type = "openai"
            base_url = "{}"
            api_key = "test-key"
            model = "{}"
            timeout = "10s"
        "#, self.base_url(), self.state.mock.model}
    }
}

async fn chat_completions(State(state): State<Arc<MockState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let header_value = |name: &str| headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string);

    state.requests.lock().unwrap().push(RecordedRequest {
        body,
        authorization: header_value("authorization"),
        request_id: header_value("x-request-id"),
    });

    let mock = &state.mock;

    match &mock.behavior {
        Behavior::Status { status, message } => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = json!({ "error": { "message": message, "type": "mock_error" } });

            (status, Json(body)).into_response()
        }
        Behavior::Reply => {
            let mut events: Vec<Value> = mock.chunks.iter().map(|chunk| mock.content_chunk(chunk)).collect();

            events.push(mock.chunk(json!([{ "index": 0, "delta": {}, "finish_reason": mock.finish_reason }])));

            let mut usage_chunk = mock.chunk(json!([]));
            usage_chunk["usage"] = json!({ "prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17 });
            events.push(usage_chunk);

            event_stream(&events, true)
        }
        Behavior::MidStreamError { message } => {
            let mut events: Vec<Value> = mock.chunks.iter().map(|chunk| mock.content_chunk(chunk)).collect();
            events.push(json!({ "error": { "message": message, "type": "server_error" } }));

            event_stream(&events, false)
        }
    }
}

impl OpenAIMock {
    fn chunk(&self, choices: Value) -> Value {
        json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion.chunk",
            "created": 1_700_000_000,
            "model": self.model,
            "choices": choices,
        })
    }

    fn content_chunk(&self, content: &str) -> Value {
        self.chunk(json!([{ "index": 0, "delta": { "content": content }, "finish_reason": null }]))
    }
}

fn event_stream(events: &[Value], done: bool) -> Response {
    let mut body: String = events.iter().map(|event| format!("data: {event}\n\n")).collect();

    if done {
        body.push_str("data: [DONE]\n\n");
    }

    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}
