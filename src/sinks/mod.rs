//! Log and progress sinks.
//!
//! The runner never talks to a terminal or UI directly. It appends lines to a
//! `LogSink` and reports fractions to a `ProgressReporter`; whoever embeds
//! the runner decides where those go.

pub mod file;
pub mod memory;

use std::sync::Arc;

use tracing::info;

pub use file::FileLogSink;
pub use memory::{MemoryLogSink, MemoryProgress};

/// Append-only sink for human-readable lines
pub trait LogSink: Send + Sync {
    /// Append one line (no trailing newline)
    fn append(&self, line: &str);
}

/// Receiver of progress fractions in `[0.0, 1.0]`
pub trait ProgressReporter: Send + Sync {
    /// Report the current fraction; values never decrease within one run
    fn report(&self, fraction: f64);

    /// Update the short status text shown next to the progress value
    fn set_text(&self, _text: &str) {}
}

/// Re-emits lines as `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&self, line: &str) {
        info!("{}", line);
    }
}

/// Logs progress changes through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&self, fraction: f64) {
        info!(percent = (fraction * 100.0).round() as u32, "Progress");
    }

    fn set_text(&self, text: &str) {
        info!(status = %text, "Progress");
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressReporter for NullProgress {
    fn report(&self, _fraction: f64) {}
}

/// Forwards every line to several sinks, in order
#[derive(Default, Clone)]
pub struct FanoutLogSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl LogSink for FanoutLogSink {
    fn append(&self, line: &str) {
        for sink in &self.sinks {
            sink.append(line);
        }
    }
}
