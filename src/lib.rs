//! taintbomb - External stage pipeline runner for Java source obfuscation
//!
//! Runs an ordered list of external processes (Python obfuscation scripts)
//! over a copy of a Java source tree, one at a time, streaming their output
//! into a log sink and reporting progress as it goes.
//!
//! # Architecture
//!
//! - A run executes stages strictly in sequence and ends with exactly one
//!   outcome: success, failure at a named stage, or cancellation
//! - Every stage transition is appended to a per-run event journal
//! - Run summaries are derived by replaying the journal
//!
//! # Modules
//!
//! - `core`: Execution (executor, output drain, runner, plans, journal)
//! - `domain`: Data structures (StageDescriptor, Event, PipelineRun)
//! - `sinks`: Log and progress destinations
//! - `config`: Layered configuration and persisted settings
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Obfuscate a source tree
//! taintbomb run ./src --output ./obfuscated
//!
//! # Check run status
//! taintbomb status <run-id>
//!
//! # Turn a feature off
//! taintbomb settings disable method-splitting
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod sinks;

// Re-export main types at crate root for convenience
pub use crate::core::{CancelToken, PipelineRunner, ProcessExecutor, StageExecutor, StagePlan};
pub use crate::domain::{Event, EventType, PipelineRun, RunOutcome, RunState, StageDescriptor};
pub use crate::sinks::{LogSink, ProgressReporter};
