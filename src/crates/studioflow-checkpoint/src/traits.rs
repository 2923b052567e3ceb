//! Checkpoint storage trait
//!
//! [`CheckpointSaver`] is the seam between the workflow engine and whatever store
//! keeps run checkpoints. Implementations must provide compare-and-swap semantics on
//! [`Checkpoint::version`]:
//!
//! - `version == 0`: insert; fails with [`CheckpointError::Conflict`] if a checkpoint
//!   for the run already exists.
//! - `version == n`: overwrite only if the stored version is still `n`; otherwise
//!   [`CheckpointError::Conflict`].
//!
//! On success the returned checkpoint carries `version + 1` and a fresh `updated_at`.
//! The CAS is what serialises concurrent writers of the same run across processes.
//!
//! ```rust,ignore
//! let stored = saver.put(checkpoint).await?;
//! let mut next = stored.clone();
//! next.metadata.current_step = "production".into();
//! saver.put(next).await?;              // ok, version 1 -> 2
//! saver.put(stored).await.unwrap_err(); // stale version 1
//! ```
//!
//! [`CheckpointError::Conflict`]: crate::CheckpointError::Conflict

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend for run checkpoints
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Load the checkpoint of a run
    async fn get(&self, run_id: &str) -> Result<Option<Checkpoint>>;

    /// Store a checkpoint with compare-and-swap on its version
    async fn put(&self, checkpoint: Checkpoint) -> Result<Checkpoint>;

    /// Delete the checkpoint of a run, returning whether one existed
    async fn delete(&self, run_id: &str) -> Result<bool>;

    /// Whether the store can currently serve reads and writes
    async fn healthy(&self) -> bool;
}
