//! The research workflow state machine.
//!
//! Steps run strictly in sequence for a session:
//! `GenerateQueries -> ExecuteSearch -> Synthesize -> Extract -> Reflect`,
//! with `Reflect` routing to `Terminal` or back to `GenerateQueries`. After
//! each of the first four steps the engine may checkpoint and yield; `resume`
//! picks the run up from the stored step, possibly in another process.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reflection::route;
use super::runner::{event_channel, EventSink, EventStream, StepRunner};
use super::steps::StepContext;
use super::types::{
    event_names, ProgressEvent, ResearchOutput, RunOutcome, Session, StateDelta, StepName,
    WorkflowState,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::StructuredModel;
use crate::search::SearchProvider;
use crate::storage::{CheckpointRecord, Checkpointer};

/// Drives research sessions through the step graph.
///
/// Cheap to clone; clones share collaborators and the session leases.
#[derive(Clone)]
pub struct WorkflowEngine {
    model: Arc<dyn StructuredModel>,
    search: Arc<dyn SearchProvider>,
    checkpointer: Arc<dyn Checkpointer>,
    config: EngineConfig,
    leases: SessionLeases,
}

impl WorkflowEngine {
    /// Create a new engine
    pub fn new(
        model: Arc<dyn StructuredModel>,
        search: Arc<dyn SearchProvider>,
        checkpointer: Arc<dyn Checkpointer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            model,
            search,
            checkpointer,
            config,
            leases: SessionLeases::default(),
        }
    }

    /// The checkpoint store this engine writes to.
    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a new session from `GenerateQueries`.
    ///
    /// Fails with `ConcurrencyMisuse` if the session is already running or
    /// already has a checkpoint; use [`WorkflowEngine::resume`] for those.
    pub async fn run(
        &self,
        session: Session,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        session.validate()?;
        let _lease = self.leases.acquire(&session.session_id)?;

        if self.checkpointer.load(&session.session_id).await?.is_some() {
            return Err(EngineError::ConcurrencyMisuse {
                session_id: session.session_id.clone(),
                reason: "session already exists, resume it instead".to_string(),
            });
        }

        info!(
            session_id = %session.session_id,
            target = %session.target,
            max_reflection_steps = session.config.max_reflection_steps,
            "Research run started"
        );

        self.drive(
            &session,
            WorkflowState::default(),
            StepName::GenerateQueries,
            &sink,
            &cancel,
        )
        .await
    }

    /// Continue a suspended session from its checkpoint.
    ///
    /// `resume_input` is whatever the external actor supplied; it is logged
    /// but does not change the workflow state.
    pub async fn resume(
        &self,
        session_id: &str,
        resume_input: Value,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let _lease = self.leases.acquire(session_id)?;

        let record = self
            .checkpointer
            .load(session_id)
            .await?
            .ok_or_else(|| EngineError::ConcurrencyMisuse {
                session_id: session_id.to_string(),
                reason: "no pending checkpoint".to_string(),
            })?;

        if record.is_completed() {
            return Err(EngineError::ConcurrencyMisuse {
                session_id: session_id.to_string(),
                reason: "session already completed".to_string(),
            });
        }

        info!(
            session_id = %session_id,
            next_step = %record.next_step,
            resume_input = %resume_input,
            "Research run resumed"
        );

        self.drive(&record.session, record.state, record.next_step, &sink, &cancel)
            .await
    }

    /// Spawn [`WorkflowEngine::run`] and hand back its event stream.
    pub fn start(
        &self,
        session: Session,
        cancel: CancellationToken,
    ) -> (JoinHandle<EngineResult<RunOutcome>>, EventStream) {
        let (sink, stream) = event_channel(self.config.event_buffer);
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run(session, sink, cancel).await });
        (handle, stream)
    }

    /// Spawn [`WorkflowEngine::resume`] and hand back its event stream.
    pub fn resume_streaming(
        &self,
        session_id: impl Into<String>,
        resume_input: Value,
        cancel: CancellationToken,
    ) -> (JoinHandle<EngineResult<RunOutcome>>, EventStream) {
        let (sink, stream) = event_channel(self.config.event_buffer);
        let engine = self.clone();
        let session_id = session_id.into();
        let handle = tokio::spawn(async move {
            engine
                .resume(&session_id, resume_input, sink, cancel)
                .await
        });
        (handle, stream)
    }

    async fn drive(
        &self,
        session: &Session,
        mut state: WorkflowState,
        start: StepName,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let result = self.step_loop(session, &mut state, start, sink, cancel).await;
        match &result {
            Ok(RunOutcome::Completed(output)) => info!(
                session_id = %session.session_id,
                reflection_steps_taken = output.reflection_steps_taken,
                "Research run completed"
            ),
            Ok(RunOutcome::Suspended { awaiting, .. }) => info!(
                session_id = %session.session_id,
                awaiting = %awaiting,
                "Research run suspended"
            ),
            Err(EngineError::Cancelled { .. }) => warn!(
                session_id = %session.session_id,
                "Research run cancelled"
            ),
            Err(e) => error!(
                session_id = %session.session_id,
                error = %e,
                "Research run failed"
            ),
        }
        result
    }

    async fn step_loop(
        &self,
        session: &Session,
        state: &mut WorkflowState,
        start: StepName,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let ctx = StepContext {
            session,
            model: self.model.as_ref(),
            search: Arc::clone(&self.search),
            max_tokens_per_source: self.config.max_tokens_per_source,
        };
        let runner = StepRunner::new(&session.session_id, sink, cancel);

        let mut step = start;
        while step != StepName::Terminal {
            let (delta, _) = runner.execute(step, ctx.run(step, state)).await?;
            state.apply(delta);

            let next = match step {
                StepName::Reflect => {
                    self.route_after_reflection(session, state, sink, cancel)
                        .await?
                }
                other => other.successor().unwrap_or(StepName::Terminal),
            };
            state.apply(StateDelta {
                next_step: Some(next),
                ..Default::default()
            });

            if self.suspends_after(step) {
                return self.suspend(session, state, next, sink, cancel).await;
            }

            step = next;
        }

        self.finish(session, state, sink, cancel).await
    }

    /// Only the documented suspension points pause a run, whatever the
    /// configured list holds.
    fn suspends_after(&self, step: StepName) -> bool {
        step.is_suspension_point() && self.config.suspend_after.contains(&step)
    }

    async fn route_after_reflection(
        &self,
        session: &Session,
        state: &WorkflowState,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> EngineResult<StepName> {
        let next = route(state, &session.config);
        if next == StepName::GenerateQueries {
            debug!(
                session_id = %session.session_id,
                reflection_steps_taken = state.reflection_steps_taken,
                max_reflection_steps = session.config.max_reflection_steps,
                "Reflection unsatisfied, looping back"
            );
            let event = ProgressEvent::new(
                event_names::REROUTE,
                json!({
                    "reroute": next,
                    "reflectionStepsTaken": state.reflection_steps_taken,
                }),
            );
            if !sink.emit_or_cancel(event, cancel).await {
                return Err(cancelled(session));
            }
        }
        Ok(next)
    }

    /// Persist and yield. `awaiting` is only emitted once the save landed.
    async fn suspend(
        &self,
        session: &Session,
        state: &WorkflowState,
        next: StepName,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> EngineResult<RunOutcome> {
        if cancel.is_cancelled() {
            return Err(cancelled(session));
        }

        self.checkpointer
            .save(&CheckpointRecord::new(session, state, next))
            .await?;

        let event = ProgressEvent::new(event_names::AWAITING, json!({ "awaiting": next }));
        if !sink.emit_or_cancel(event, cancel).await {
            return Err(cancelled(session));
        }

        Ok(RunOutcome::Suspended {
            session_id: session.session_id.clone(),
            awaiting: next,
        })
    }

    /// Record completion so later resumes are rejected, then emit `END`.
    async fn finish(
        &self,
        session: &Session,
        state: &WorkflowState,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> EngineResult<RunOutcome> {
        if cancel.is_cancelled() {
            return Err(cancelled(session));
        }

        self.checkpointer
            .save(&CheckpointRecord::new(session, state, StepName::Terminal))
            .await?;

        let output = ResearchOutput {
            extracted_info: state.extracted_info.clone().unwrap_or(Value::Null),
            search_results: session
                .config
                .include_search_results
                .then(|| state.search_results.clone()),
            reflection_steps_taken: state.reflection_steps_taken,
        };

        let mut end = json!({ "info": output.extracted_info });
        if let Some(results) = &output.search_results {
            end["searchResults"] = json!(results);
        }
        if !sink
            .emit_or_cancel(ProgressEvent::new(event_names::END, end), cancel)
            .await
        {
            return Err(cancelled(session));
        }

        Ok(RunOutcome::Completed(output))
    }
}

fn cancelled(session: &Session) -> EngineError {
    EngineError::Cancelled {
        session_id: session.session_id.clone(),
    }
}

/// In-process guard allowing one run or resume per session at a time.
#[derive(Clone, Default)]
struct SessionLeases {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionLeases {
    fn acquire(&self, session_id: &str) -> EngineResult<SessionLease> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(session_id.to_string()) {
            return Err(EngineError::ConcurrencyMisuse {
                session_id: session_id.to_string(),
                reason: "a run is already in flight for this session".to_string(),
            });
        }
        Ok(SessionLease {
            active: Arc::clone(&self.active),
            session_id: session_id.to_string(),
        })
    }
}

struct SessionLease {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.session_id);
    }
}
