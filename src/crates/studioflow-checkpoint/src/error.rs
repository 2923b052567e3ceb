//! Checkpoint store errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Error, Debug)]
pub enum CheckpointError {
    /// A compare-and-swap write lost: the stored version is not the one the writer read
    #[error("Run {run_id} checkpoint is at version {actual}, write expected {expected}")]
    Conflict {
        run_id: String,
        expected: i64,
        actual: i64,
    },

    /// Run state could not be encoded or decoded
    #[error("Checkpoint state encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store rejected or failed the operation
    #[error("Checkpoint store failure: {0}")]
    Storage(String),

    /// A checkpoint violates its own invariants (duplicate interrupt, bad timestamp)
    #[error("Malformed checkpoint: {0}")]
    Invalid(String),
}
