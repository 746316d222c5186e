//! Resumable company research workflow.
//!
//! [`WorkflowEngine`] sequences the steps, [`StepRunner`] wraps each one with
//! timing and its progress event, and the reflection gate decides when the
//! loop ends. Source and note formatting live in [`format`].

mod engine;
pub mod format;
pub mod reflection;
mod runner;
pub mod schema;
pub mod steps;
mod types;

pub use engine::WorkflowEngine;
pub use format::{dedupe_sources, format_notes, format_sources};
pub use reflection::{route, ReflectionGate, ReflectionVerdict, MAX_FOLLOW_UP_QUERIES};
pub use runner::{event_channel, EventSink, EventStream, StepOutput, StepRunner};
pub use schema::{default_extraction_schema, validate_against};
pub use steps::StepContext;
pub use types::{
    event_names, ProgressEvent, ResearchConfig, ResearchOutput, RunOutcome, Session, StateDelta,
    StepName, WorkflowState,
};
