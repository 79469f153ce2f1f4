//! Run observation hooks.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;

use crate::{
    messages::openai::FinishReason,
    request::RequestContext,
    runtime::{RuntimeError, RuntimeEvent, RuntimeEventStream, TraceMode},
};

/// Receives the lifecycle of every run dispatched to the runtime.
pub trait RunTracer: Send + Sync {
    fn on_run_start(&self, run: &RunInfo);

    fn on_run_end(&self, run: &RunInfo, outcome: &RunOutcome);
}

/// Identity of a run as seen by tracers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub log_id: String,
    pub project_id: String,
    pub thread_id: String,
    pub trace_mode: TraceMode,
}

impl RunInfo {
    pub fn new(context: &RequestContext, thread_id: &str, trace_mode: TraceMode) -> Self {
        Self {
            run_id: context.run_id.clone(),
            log_id: context.log_id.clone(),
            project_id: context.project_id.clone(),
            thread_id: thread_id.to_string(),
            trace_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(FinishReason),
    Failed(String),
    Cancelled,
}

/// Reports runs through the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl RunTracer for LogTracer {
    fn on_run_start(&self, run: &RunInfo) {
        log::info!(
            project_id = run.project_id.as_str(),
            run_id = run.run_id.as_str(),
            log_id = run.log_id.as_str(),
            thread_id = run.thread_id.as_str(),
            mode = run.trace_mode.as_str();
            "Run started"
        );
    }

    fn on_run_end(&self, run: &RunInfo, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed(finish_reason) => log::info!(
                project_id = run.project_id.as_str(),
                run_id = run.run_id.as_str(),
                log_id = run.log_id.as_str(),
                finish_reason:% = finish_reason;
                "Run completed"
            ),
            RunOutcome::Failed(message) => log::warn!(
                project_id = run.project_id.as_str(),
                run_id = run.run_id.as_str(),
                log_id = run.log_id.as_str();
                "Run failed: {message}"
            ),
            RunOutcome::Cancelled => log::info!(
                project_id = run.project_id.as_str(),
                run_id = run.run_id.as_str(),
                log_id = run.log_id.as_str();
                "Run cancelled"
            ),
        }
    }
}

/// A run reported as started whose event stream is not available yet.
///
/// Dropped before [`PendingRun::trace`] or [`PendingRun::end`], for instance
/// when the client goes away while the runtime is dispatching, it reports the
/// run as cancelled.
pub(crate) struct PendingRun {
    tracer: Arc<dyn RunTracer>,
    run: RunInfo,
    reported: bool,
}

impl PendingRun {
    pub(crate) fn start(tracer: Arc<dyn RunTracer>, run: RunInfo) -> Self {
        tracer.on_run_start(&run);

        Self {
            tracer,
            run,
            reported: false,
        }
    }

    /// Hand the end of the run over to its event stream.
    pub(crate) fn trace(mut self, events: RuntimeEventStream) -> TracedEvents {
        self.reported = true;
        TracedEvents::new(events, self.tracer.clone(), self.run.clone())
    }

    pub(crate) fn end(mut self, outcome: RunOutcome) {
        self.reported = true;
        self.tracer.on_run_end(&self.run, &outcome);
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if !self.reported {
            self.tracer.on_run_end(&self.run, &RunOutcome::Cancelled);
        }
    }
}

/// Stream wrapper reporting the end of a run to its tracer.
///
/// Exactly one outcome is reported: the first error, the terminal event, the
/// end of the stream, or cancellation when dropped before any of those.
pub(crate) struct TracedEvents {
    inner: RuntimeEventStream,
    tracer: Arc<dyn RunTracer>,
    run: RunInfo,
    reported: bool,
}

impl TracedEvents {
    pub(crate) fn new(inner: RuntimeEventStream, tracer: Arc<dyn RunTracer>, run: RunInfo) -> Self {
        Self {
            inner,
            tracer,
            run,
            reported: false,
        }
    }

    fn report(&mut self, outcome: RunOutcome) {
        if !self.reported {
            self.reported = true;
            self.tracer.on_run_end(&self.run, &outcome);
        }
    }
}

impl Stream for TracedEvents {
    type Item = Result<RuntimeEvent, RuntimeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll_result = self.inner.as_mut().poll_next(cx);

        match &poll_result {
            Poll::Ready(Some(Ok(RuntimeEvent::Finished { finish_reason, .. }))) => {
                let finish_reason = *finish_reason;
                self.report(RunOutcome::Completed(finish_reason));
            }
            Poll::Ready(Some(Err(error))) => {
                let message = error.to_string();
                self.report(RunOutcome::Failed(message));
            }
            // The stream ended without a terminal event, the converters
            // synthesize a regular stop.
            Poll::Ready(None) => self.report(RunOutcome::Completed(FinishReason::Stop)),
            Poll::Ready(Some(Ok(_))) | Poll::Pending => {}
        }

        poll_result
    }
}

impl Drop for TracedEvents {
    fn drop(&mut self) {
        self.report(RunOutcome::Cancelled);
    }
}
