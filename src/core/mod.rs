//! Core orchestration logic.
//!
//! This module contains:
//! - CancelToken: Cooperative cancellation
//! - OutputDrain: Line forwarding from stage processes
//! - ProcessExecutor: Spawning and supervising one stage process
//! - RunJournal: Append-only event logging per run
//! - StagePlan / ObfuscationPlan: Stage lists and how they are built
//! - PipelineRunner: Main execution engine
//! - workspace: Output directory and script verification

pub mod cancel;
pub mod drain;
pub mod executor;
pub mod journal;
pub mod obfuscation;
pub mod plan;
pub mod runner;
pub mod workspace;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use drain::{DrainExit, DrainPolicy, OutputDrain};
pub use executor::{ExecError, ProcessExecutor, StageExecutor, StageExit};
pub use journal::RunJournal;
pub use obfuscation::{HelperOs, ObfuscationPlan};
pub use plan::{PlanError, ProgressSchedule, StagePlan};
pub use runner::PipelineRunner;
pub use workspace::{prepare_output, verify_scripts, WorkspaceError};
