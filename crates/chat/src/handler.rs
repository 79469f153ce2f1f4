use std::{
    convert::Infallible,
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    classifier::{self, ErrorContext},
    error::RequestError,
    messages::openai::{ChatCompletionRequest, Model, ModelsResponse, ObjectType},
    request::{self, RequestContext, RequestConverter},
    response::{DONE_FRAME, FrameStream, ResponseConverter},
    runtime::{AgentRuntime, RunConfig, RuntimeError, RuntimeEvent, RuntimeEventStream, RuntimeInput, TraceMode},
    tracer::{PendingRun, RunInfo, RunOutcome, RunTracer},
};

/// Ceiling on the runtime steps of a single run.
pub const RECURSION_LIMIT: u32 = 100;

const VALIDATION_NODE: ErrorContext = ErrorContext::new("openai_request");
const DISPATCH_NODE: ErrorContext = ErrorContext::new("openai_dispatch");
const COLLECT_NODE: ErrorContext = ErrorContext::new("openai_collect");

/// Serves chat completion requests on top of an agent runtime.
///
/// Cloned into every request, the runtime handle is the only shared state.
#[derive(Clone)]
pub struct ChatHandler {
    runtime: Arc<dyn AgentRuntime>,
    tracer: Option<Arc<dyn RunTracer>>,
    shutdown: CancellationToken,
    project_id: String,
    converter: RequestConverter,
}

impl ChatHandler {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            runtime,
            tracer: None,
            shutdown: CancellationToken::new(),
            project_id: "local".to_string(),
            converter: RequestConverter,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn RunTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Cancelling `shutdown` stops every run in flight.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn runtime(&self) -> &Arc<dyn AgentRuntime> {
        &self.runtime
    }

    /// Handle one chat completion request end to end.
    pub async fn handle(&self, headers: &HeaderMap, body: &[u8]) -> Response {
        let context = request::extract_context(headers, &self.project_id);
        let mut phase = PhaseLog::new(&context);

        phase.advance(Phase::Validating);

        let (request, input) = match self.validate(body, &context) {
            Ok(validated) => validated,
            Err(error) => {
                phase.advance(Phase::Failed);
                return classifier::classify(&error, VALIDATION_NODE).into_response();
            }
        };

        log::debug!(
            "Chat completion for model {} on session {} with {} messages, streaming: {}",
            request.model,
            input.session_id,
            input.messages.len(),
            request.is_streaming()
        );

        let converter = ResponseConverter::new(context.request_id(), request.model.clone())
            .with_usage(request.include_usage());

        let trace_mode = if request.is_streaming() {
            TraceMode::Streaming
        } else {
            TraceMode::Buffered
        };

        phase.advance(Phase::Dispatching);

        let cancellation = self.shutdown.child_token();
        let run = RunInfo::new(&context, &input.session_id, trace_mode);

        let config = RunConfig {
            recursion_limit: RECURSION_LIMIT,
            thread_id: input.session_id.clone(),
            trace_mode,
            tracer: self.tracer.clone(),
            cancellation: cancellation.clone(),
        };

        let events = match self.dispatch(input, config, &context, &run).await {
            Ok(events) => events,
            // A stream cancelled before it started ends without frames.
            Err(error)
                if trace_mode == TraceMode::Streaming
                    && (cancellation.is_cancelled() || matches!(error, RuntimeError::Cancelled)) =>
            {
                phase.advance(Phase::Failed);
                log::debug!("Run {} cancelled while dispatching", context.run_id);

                return SseBody::new(futures::stream::empty().boxed(), cancellation).into_response();
            }
            Err(error) => {
                phase.advance(Phase::Failed);
                log::error!("Failed to start run {}: {error}", context.run_id);

                let classified = classifier::classify(&error, DISPATCH_NODE);

                // The client asked for a stream, so it gets one: the error is
                // reported in-band like any other stream failure.
                if trace_mode == TraceMode::Streaming {
                    let frames = futures::stream::iter([converter.error_frame(classified), DONE_FRAME.to_string()]);
                    return SseBody::new(frames.boxed(), cancellation).into_response();
                }

                return classified.into_response();
            }
        };

        match trace_mode {
            TraceMode::Streaming => {
                phase.advance(Phase::Streaming);

                let frames = converter.iter_stream(events, cancellation.clone());
                SseBody::new(frames, cancellation).with_phase(phase).into_response()
            }
            TraceMode::Buffered => {
                phase.advance(Phase::Aggregating);

                // Dropping this future before the run completes cancels it.
                let guard = cancellation.clone().drop_guard();
                let drained = drain(events, &cancellation).await;
                guard.disarm();

                match drained {
                    Ok(events) => {
                        phase.advance(Phase::Completed);
                        Json(converter.collect(events)).into_response()
                    }
                    Err(error) => {
                        phase.advance(Phase::Failed);
                        log::error!("Run {} failed: {error}", context.run_id);

                        classifier::classify(&error, COLLECT_NODE).into_response()
                    }
                }
            }
        }
    }

    /// Models advertised by the runtime.
    pub fn models(&self) -> ModelsResponse {
        let created = u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or_default();
        let owned_by = self.runtime.name().to_string();

        let data = self
            .runtime
            .models()
            .into_iter()
            .map(|id| Model {
                id,
                object: ObjectType::Model,
                created,
                owned_by: owned_by.clone(),
            })
            .collect();

        ModelsResponse {
            object: ObjectType::List,
            data,
        }
    }

    fn validate(
        &self,
        body: &[u8],
        context: &RequestContext,
    ) -> Result<(ChatCompletionRequest, RuntimeInput), RequestError> {
        let request = self.converter.parse(body)?;
        let session_id = self.converter.get_session_id(&request, context)?;
        let input = self.converter.to_stream_input(&request, &session_id)?;

        Ok((request, input))
    }

    async fn dispatch(
        &self,
        input: RuntimeInput,
        config: RunConfig,
        context: &RequestContext,
        run: &RunInfo,
    ) -> Result<RuntimeEventStream, RuntimeError> {
        let Some(tracer) = self.tracer.clone() else {
            return self.runtime.stream_events(input, config, context).await;
        };

        let pending = PendingRun::start(tracer, run.clone());

        match self.runtime.stream_events(input, config, context).await {
            Ok(events) => Ok(pending.trace(events).boxed()),
            Err(RuntimeError::Cancelled) => {
                pending.end(RunOutcome::Cancelled);
                Err(RuntimeError::Cancelled)
            }
            Err(error) => {
                pending.end(RunOutcome::Failed(error.to_string()));
                Err(error)
            }
        }
    }
}

/// Read events up to and including the terminal one.
async fn drain(
    mut events: RuntimeEventStream,
    cancellation: &CancellationToken,
) -> Result<Vec<RuntimeEvent>, RuntimeError> {
    let mut collected = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(RuntimeError::Cancelled),
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                let terminal = event.is_terminal();
                collected.push(event);

                if terminal {
                    return Ok(collected);
                }
            }
            Some(Err(error)) => return Err(error),
            None => return Ok(collected),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Received,
    Validating,
    Dispatching,
    Streaming,
    Aggregating,
    Completed,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Phase::Received => "received",
            Phase::Validating => "validating",
            Phase::Dispatching => "dispatching",
            Phase::Streaming => "streaming",
            Phase::Aggregating => "aggregating",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };

        f.write_str(phase)
    }
}

/// Logs the transitions of one request through the handler.
struct PhaseLog {
    run_id: String,
    phase: Phase,
}

impl PhaseLog {
    fn new(context: &RequestContext) -> Self {
        log::debug!("Run {} (log id {}) received", context.run_id, context.log_id);

        Self {
            run_id: context.run_id.clone(),
            phase: Phase::Received,
        }
    }

    fn advance(&mut self, next: Phase) {
        log::debug!("Run {}: {} -> {}", self.run_id, self.phase, next);
        self.phase = next;
    }
}

/// SSE response body.
///
/// Owns the cancellation of the run it streams: the token is cancelled when
/// the body is dropped, which is how a client disconnect reaches the runtime.
struct SseBody {
    frames: FrameStream,
    phase: Option<PhaseLog>,
    _guard: DropGuard,
}

impl SseBody {
    fn new(frames: FrameStream, cancellation: CancellationToken) -> Self {
        Self {
            frames,
            phase: None,
            _guard: cancellation.drop_guard(),
        }
    }

    fn with_phase(mut self, phase: PhaseLog) -> Self {
        self.phase = Some(phase);
        self
    }
}

impl Stream for SseBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll_result = self.frames.as_mut().poll_next(cx);

        if let Poll::Ready(None) = poll_result
            && let Some(mut phase) = self.phase.take()
        {
            phase.advance(Phase::Completed);
        }

        poll_result.map(|frame| frame.map(|frame| Ok(Bytes::from(frame))))
    }
}

impl IntoResponse for SseBody {
    fn into_response(self) -> Response {
        let headers = [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ];

        (headers, Body::from_stream(self)).into_response()
    }
}
