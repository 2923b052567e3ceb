//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointSaver`] keeps one checkpoint per run in an
//! `Arc<RwLock<HashMap>>`. It honours the same compare-and-swap contract as a
//! database-backed saver, so engine code can be exercised without a store.
//! Clones share the same storage.

use crate::{
    checkpoint::Checkpoint,
    error::{CheckpointError, Result},
    traits::CheckpointSaver,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type CheckpointStorage = Arc<RwLock<HashMap<String, Checkpoint>>>;

/// In-memory checkpoint saver
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointSaver {
    storage: CheckpointStorage,
}

impl InMemoryCheckpointSaver {
    /// Create an empty saver
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Remove every checkpoint
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn get(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.storage.read().await.get(run_id).cloned())
    }

    async fn put(&self, mut checkpoint: Checkpoint) -> Result<Checkpoint> {
        let mut storage = self.storage.write().await;
        let actual = storage
            .get(&checkpoint.run_id)
            .map(|stored| stored.version)
            .unwrap_or(0);

        if actual != checkpoint.version {
            return Err(CheckpointError::Conflict {
                run_id: checkpoint.run_id,
                expected: checkpoint.version,
                actual,
            });
        }

        checkpoint.version += 1;
        checkpoint.updated_at = Utc::now();
        storage.insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        Ok(self.storage.write().await.remove(run_id).is_some())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointMetadata, Interrupt};
    use serde_json::json;

    fn checkpoint(run_id: &str) -> Checkpoint {
        Checkpoint::new(
            run_id,
            json!({"count": 0}),
            CheckpointMetadata::new("pipeline", "running", "ideation"),
        )
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let saver = InMemoryCheckpointSaver::new();
        let stored = saver.put(checkpoint("run-1")).await.unwrap();
        assert_eq!(stored.version, 1);

        let loaded = saver.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert!(saver.get("run-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_twice_conflicts() {
        let saver = InMemoryCheckpointSaver::new();
        saver.put(checkpoint("run-1")).await.unwrap();

        let err = saver.put(checkpoint("run-1")).await.unwrap_err();
        match err {
            CheckpointError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let saver = InMemoryCheckpointSaver::new();
        let v1 = saver.put(checkpoint("run-1")).await.unwrap();

        let mut first = v1.clone();
        first.metadata.current_step = "production".to_string();
        let v2 = saver.put(first).await.unwrap();
        assert_eq!(v2.version, 2);

        // A writer still holding version 1 loses
        let mut second = v1;
        second
            .push_interrupt(Interrupt::new("videos", "wait_for_videos"))
            .unwrap();
        assert!(matches!(
            saver.put(second).await,
            Err(CheckpointError::Conflict { .. })
        ));

        let loaded = saver.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.metadata.current_step, "production");
        assert!(loaded.pending_interrupts.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let saver = InMemoryCheckpointSaver::new();
        saver.put(checkpoint("run-1")).await.unwrap();
        saver.put(checkpoint("run-2")).await.unwrap();
        assert_eq!(saver.checkpoint_count().await, 2);

        assert!(saver.delete("run-1").await.unwrap());
        assert!(!saver.delete("run-1").await.unwrap());
        assert_eq!(saver.checkpoint_count().await, 1);

        saver.clear().await;
        assert_eq!(saver.checkpoint_count().await, 0);
        assert!(saver.healthy().await);
    }
}
