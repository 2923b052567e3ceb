//! Database models

pub mod dead_letter;
pub mod job;
pub mod run;

pub use dead_letter::DeadLetterEntry;
pub use job::{Job, JobStatus};
pub use run::Run;
