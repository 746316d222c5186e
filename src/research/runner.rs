//! Progress event channel and the per-step wrapper that feeds it.

use futures::Stream;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::types::{ProgressEvent, StateDelta, StepName};
use crate::error::{EngineError, EngineResult};

/// Create a bounded progress channel.
pub fn event_channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSink { tx },
        EventStream {
            inner: ReceiverStream::new(rx),
        },
    )
}

/// Producer half of the progress channel. Dropping it closes the stream.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl EventSink {
    /// Hand an event to the consumer, waiting for buffer space.
    ///
    /// A consumer that went away is not an error: the run continues and the
    /// event is discarded.
    pub async fn emit(&self, event: ProgressEvent) {
        let name = event.name.clone();
        if self.tx.send(event).await.is_err() {
            debug!(event = %name, "Event stream consumer dropped, discarding event");
        }
    }

    /// [`emit`](Self::emit) raced against `cancel`, so a stalled consumer
    /// cannot pin a cancelled run. Returns `false` if the event was dropped
    /// because of cancellation.
    pub async fn emit_or_cancel(&self, event: ProgressEvent, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.emit(event) => true,
        }
    }

    /// A sink whose events go nowhere.
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

/// Ordered, single-consumer stream of [`ProgressEvent`]s.
///
/// Ends when every [`EventSink`] clone is dropped. A stream that ends without
/// an `END` or `awaiting` event belongs to a failed run.
pub struct EventStream {
    inner: ReceiverStream<ProgressEvent>,
}

impl Stream for EventStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// What a step hands back to the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub delta: StateDelta,
    /// Public event name for this step.
    pub event: &'static str,
    pub event_data: Value,
}

/// Wraps one step: cancellation, timing, logging and its progress event.
pub struct StepRunner<'a> {
    session_id: &'a str,
    sink: &'a EventSink,
    cancel: &'a CancellationToken,
}

impl<'a> StepRunner<'a> {
    pub fn new(session_id: &'a str, sink: &'a EventSink, cancel: &'a CancellationToken) -> Self {
        Self {
            session_id,
            sink,
            cancel,
        }
    }

    /// Run `work` for `step` and emit its event.
    ///
    /// The event is handed to the sink before this returns. On cancellation
    /// the step future is dropped (aborting any tasks it owns) and no event
    /// is emitted.
    pub async fn execute<F>(&self, step: StepName, work: F) -> EngineResult<(StateDelta, Duration)>
    where
        F: Future<Output = EngineResult<StepOutput>>,
    {
        let start = Instant::now();
        debug!(step = %step, session_id = %self.session_id, "Step started");

        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!(step = %step, session_id = %self.session_id, "Step cancelled");
                return Err(EngineError::Cancelled {
                    session_id: self.session_id.to_string(),
                });
            }
            result = work => result,
        };

        let elapsed = start.elapsed();
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!(
                    step = %step,
                    session_id = %self.session_id,
                    latency_ms = elapsed.as_millis(),
                    error = %e,
                    "Step failed"
                );
                return Err(e);
            }
        };

        info!(
            step = %step,
            session_id = %self.session_id,
            latency_ms = elapsed.as_millis(),
            "Step completed"
        );

        let mut data = output.event_data;
        if reports_elapsed(step) {
            if let Value::Object(map) = &mut data {
                map.insert("elapsedMs".to_string(), Value::from(elapsed.as_millis() as u64));
            }
        }
        let event = ProgressEvent::new(output.event, data);
        if !self.sink.emit_or_cancel(event, self.cancel).await {
            info!(step = %step, session_id = %self.session_id, "Step cancelled while emitting");
            return Err(EngineError::Cancelled {
                session_id: self.session_id.to_string(),
            });
        }

        Ok((output.delta, elapsed))
    }
}

fn reports_elapsed(step: StepName) -> bool {
    matches!(step, StepName::ExecuteSearch | StepName::Extract)
}
