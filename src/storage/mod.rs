//! Checkpoint persistence for suspended research sessions.
//!
//! A checkpoint is the durable snapshot of a session's workflow state plus
//! the step to resume into. There is exactly one per session: every save
//! replaces the previous one.

mod memory;
mod sqlite;


pub use memory::MemoryCheckpointer;
pub use sqlite::SqliteCheckpointer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::research::{Session, StepName, WorkflowState};

/// Version of the serialized checkpoint layout.
pub const CHECKPOINT_SCHEMA_VERSION: i64 = 1;

/// Durable snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    /// Primary key.
    pub session_id: String,
    /// The immutable run inputs, so a resume needs only the id.
    pub session: Session,
    pub state: WorkflowState,
    /// Step to run on resume. `Terminal` marks a finished session.
    pub next_step: StepName,
    pub schema_version: i64,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Snapshot `state` for `session`, resuming into `next_step`.
    pub fn new(session: &Session, state: &WorkflowState, next_step: StepName) -> Self {
        Self {
            session_id: session.session_id.clone(),
            session: session.clone(),
            state: state.clone(),
            next_step,
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            updated_at: Utc::now(),
        }
    }

    /// Whether the session already reached its terminal step.
    pub fn is_completed(&self) -> bool {
        self.next_step == StepName::Terminal
    }
}

/// Checkpoint store contract.
///
/// A `save` that returned `Ok` must be visible to a later `load` from any
/// process sharing the store. Callers serialize saves per session.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Insert or replace the checkpoint for `record.session_id`.
    async fn save(&self, record: &CheckpointRecord) -> StorageResult<()>;
    /// Load the checkpoint for a session, if any.
    async fn load(&self, session_id: &str) -> StorageResult<Option<CheckpointRecord>>;
    /// Remove a session's checkpoint. Missing sessions are not an error.
    async fn delete(&self, session_id: &str) -> StorageResult<()>;
}
