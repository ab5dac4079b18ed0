//! Domain types for the pipeline runner.
//!
//! This module contains the core data structures:
//! - Stage: External program descriptors
//! - Run: Pipeline execution state and outcomes
//! - Events: Journal records of stage transitions

pub mod events;
pub mod run;
pub mod stage;

// Re-export commonly used types
pub use events::{Event, EventType, StageStatus};
pub use run::{FailureReason, PipelineRun, RunOutcome, RunState, StageRecord, TERMINATED_EXIT_CODE};
pub use stage::{FailurePolicy, StageDescriptor};
