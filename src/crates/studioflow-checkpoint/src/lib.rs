//! # studioflow-checkpoint - Run Checkpoints and Interrupts
//!
//! Data types and storage abstractions for durably suspending and resuming workflow
//! runs.
//!
//! ## Overview
//!
//! Each run owns exactly one [`Checkpoint`], overwritten on every step transition.
//! It holds:
//!
//! - **State** - the run's serialized variables
//! - **Pending interrupts** - durable suspension points ([`Interrupt`]) the run is
//!   waiting on, each keyed by an event kind or a HITL gate
//! - **Metadata** - projection fields (`status`, `current_step`, `error`,
//!   `artifacts`) written together with the state
//! - **Version** - a counter used for compare-and-swap writes
//!
//! ## Storage
//!
//! The [`CheckpointSaver`] trait is implemented by storage backends. This crate
//! ships [`InMemoryCheckpointSaver`] for tests and development; the `studioflow`
//! crate provides a SQLite-backed saver that also maintains the run projection
//! table inside the same transaction.
//!
//! ```rust
//! use studioflow_checkpoint::{
//!     Checkpoint, CheckpointMetadata, CheckpointSaver, InMemoryCheckpointSaver, Interrupt,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let saver = InMemoryCheckpointSaver::new();
//! let metadata = CheckpointMetadata::new("pipeline", "running", "wait_for_render");
//! let mut checkpoint = Checkpoint::new("run-1", json!({}), metadata);
//! checkpoint.push_interrupt(Interrupt::new("render", "wait_for_render"))?;
//!
//! let stored = saver.put(checkpoint).await?;
//! assert_eq!(stored.version, 1);
//! assert_eq!(stored.pending_matching("render").len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod traits;

pub use checkpoint::{Checkpoint, CheckpointMetadata, Interrupt};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointSaver;
pub use traits::CheckpointSaver;
