//! Journal events for pipeline runs.
//!
//! Every stage transition is recorded as an immutable event in an
//! append-only log, so a finished (or crashed) run can be inspected later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::FailureReason;

/// A single event in a run journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage name (if applicable)
    pub stage: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO secrets)
    pub message: String,

    /// Status of the stage/run after this event
    pub status: StageStatus,

    /// Exit code reported by the process, if it exited on its own
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Time taken in milliseconds (for finished stages)
    #[serde(default)]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default)]
    pub error: Option<String>,

    /// Tagged failure reason for failed stages and runs
    #[serde(default)]
    pub reason: Option<FailureReason>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        stage: Option<String>,
        event_type: EventType,
        message: String,
        status: StageStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage,
            event_type,
            message,
            status,
            exit_code: None,
            duration_ms: None,
            error: None,
            reason: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach a failure reason (and its display code)
    pub fn with_reason(mut self, reason: FailureReason) -> Self {
        self.exit_code = Some(reason.exit_code());
        self.error = Some(reason.to_string());
        self.reason = Some(reason);
        self
    }
}

/// Types of events recorded during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,

    StageStarted,

    /// Disabled in configuration
    StageSkipped,

    StageCompleted,

    /// Advisory stage failed; the run went on
    StageWarned,

    StageFailed,
    StageTimedOut,
}

/// Status of a stage or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Warned,
    Failed,
    Skipped,
    Cancelled,
}
