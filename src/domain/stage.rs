//! Stage descriptors.
//!
//! A stage is one external program invocation. Descriptors are plain data:
//! they are built once per run (from settings or a YAML pipeline file) and
//! never mutated while the run is in progress.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single external stage in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Stage name (unique within a pipeline, used to tag output lines)
    pub name: String,

    /// Human-readable label for start/skip messages ("Removing comments")
    #[serde(default)]
    pub label: Option<String>,

    /// Full argument vector: program followed by its arguments
    pub invocation: Vec<String>,

    /// Wall-clock limit for the process; `None` waits indefinitely
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Disabled stages are logged as skipped and never spawned
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// What a non-zero exit means for the rest of the run
    #[serde(default)]
    pub on_failure: FailurePolicy,

    /// Extra text printed when an advisory stage fails
    #[serde(default)]
    pub notice: Option<String>,

    /// Line logged when the stage exits successfully
    #[serde(default)]
    pub success_message: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl StageDescriptor {
    /// Create an enabled, aborting stage without a timeout
    pub fn new(name: impl Into<String>, invocation: Vec<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            invocation,
            timeout_seconds: None,
            enabled: true,
            on_failure: FailurePolicy::Abort,
            notice: None,
            success_message: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Mark the stage advisory: failures are reported but do not abort
    pub fn advisory(mut self, notice: Option<String>) -> Self {
        self.on_failure = FailurePolicy::Warn;
        self.notice = notice;
        self
    }

    pub fn with_success_message(mut self, message: impl Into<String>) -> Self {
        self.success_message = Some(message.into());
        self
    }

    /// Effective timeout as a `Duration`
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Label used in progress messages, falling back to the stage name
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    pub fn is_advisory(&self) -> bool {
        self.on_failure == FailurePolicy::Warn
    }

    /// Program to execute (first element of the invocation)
    pub fn program(&self) -> Option<&str> {
        self.invocation.first().map(String::as_str)
    }

    /// Arguments passed to the program
    pub fn args(&self) -> &[String] {
        self.invocation.get(1..).unwrap_or(&[])
    }
}

/// How the runner reacts to a failing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the whole pipeline
    #[default]
    Abort,

    /// Log a warning and continue with the next stage
    Warn,
}
