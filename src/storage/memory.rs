use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{CheckpointRecord, Checkpointer};
use crate::error::StorageResult;

/// Process-local checkpoint store for tests and one-shot runs.
#[derive(Clone, Default)]
pub struct MemoryCheckpointer {
    records: Arc<RwLock<HashMap<String, CheckpointRecord>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, record: &CheckpointRecord) -> StorageResult<()> {
        self.records
            .write()
            .await
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> StorageResult<Option<CheckpointRecord>> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> StorageResult<()> {
        self.records.write().await.remove(session_id);
        Ok(())
    }
}
