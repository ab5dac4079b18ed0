//! Run state, outcomes and reconstruction from journal events.
//!
//! A `PipelineRun` is owned by the call that executes the pipeline. Its state
//! machine is `Pending -> Running(stage) -> {Succeeded | Failed | Cancelled}`;
//! once a terminal state is reached it never changes again.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, StageStatus};

/// Exit code shown for stages that did not exit on their own
pub const TERMINATED_EXIT_CODE: i32 = -1;

/// Why a stage failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The process exited with a non-zero code
    ExitCode(i32),

    /// The process outlived its timeout and was terminated
    TimedOut { limit_seconds: u64 },

    /// The process was killed by a signal it did not ask for
    Terminated,

    /// Launching or waiting on the process failed
    Io(String),
}

impl FailureReason {
    /// Exit code for display; runner-side failures map to `-1`
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ExitCode(code) => *code,
            Self::TimedOut { .. } | Self::Terminated | Self::Io(_) => TERMINATED_EXIT_CODE,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode(code) => write!(f, "exit code {}", code),
            Self::TimedOut { limit_seconds } => write!(f, "timed out after {}s", limit_seconds),
            Self::Terminated => write!(f, "terminated by signal"),
            Self::Io(message) => write!(f, "I/O error: {}", message),
        }
    }
}

/// Terminal outcome of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    /// Every stage ran without an aborting failure
    Success,

    /// An aborting stage failed
    Failed { stage: String, reason: FailureReason },

    /// A cancellation request interrupted the run
    Cancelled,
}

impl RunOutcome {
    /// Shorthand for a stage that exited with a non-zero code
    pub fn failed(stage: impl Into<String>, exit_code: i32) -> Self {
        Self::Failed {
            stage: stage.into(),
            reason: FailureReason::ExitCode(exit_code),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Exit code of the failing stage (`-1` for runner-side failures)
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { reason, .. } => Some(reason.exit_code()),
            _ => None,
        }
    }

    /// Process exit status for the CLI
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed { .. } => 1,
            Self::Cancelled => 130,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed { stage, reason } => write!(f, "failed at '{}' ({})", stage, reason),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Created, no stage started yet
    #[default]
    Pending,

    /// Executing (or skipping) the stage at `stage_index`
    Running { stage_index: usize },

    /// Finished with a terminal outcome
    Finished { outcome: RunOutcome },
}

/// Per-stage bookkeeping inside a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
}

/// A single execution of a stage list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the pipeline being executed
    pub pipeline_name: String,

    /// Current state of the run
    pub state: RunState,

    /// Last reported progress fraction (never decreases)
    pub progress: f64,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Stages in execution order, with their latest status
    pub stages: Vec<StageRecord>,
}

impl PipelineRun {
    pub fn new(id: Uuid, pipeline_name: impl Into<String>) -> Self {
        Self {
            id,
            pipeline_name: pipeline_name.into(),
            state: RunState::Pending,
            progress: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            stages: Vec::new(),
        }
    }

    /// Move to the given stage. Ignored once the run is finished.
    pub fn enter_stage(&mut self, stage_index: usize) -> bool {
        if self.is_finished() {
            return false;
        }
        self.state = RunState::Running { stage_index };
        true
    }

    /// Record the latest status of a stage
    pub fn record_stage(
        &mut self,
        name: &str,
        status: StageStatus,
        exit_code: Option<i32>,
        duration_ms: Option<u64>,
    ) {
        match self.stages.iter_mut().find(|s| s.name == name) {
            Some(record) => {
                record.status = status;
                record.exit_code = exit_code.or(record.exit_code);
                record.duration_ms = duration_ms.or(record.duration_ms);
            }
            None => self.stages.push(StageRecord {
                name: name.to_string(),
                status,
                exit_code,
                duration_ms,
            }),
        }
    }

    /// Raise the progress fraction, returning the value to report.
    ///
    /// The fraction is clamped to `[0, 1]` and never goes backwards.
    pub fn advance_progress(&mut self, fraction: f64) -> f64 {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        if fraction > self.progress {
            self.progress = fraction;
        }
        self.progress
    }

    /// Enter a terminal state. Returns false if the run already finished.
    pub fn finish(&mut self, outcome: RunOutcome) -> bool {
        if self.is_finished() {
            return false;
        }
        self.state = RunState::Finished { outcome };
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        match &self.state {
            RunState::Finished { outcome } => Some(outcome),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, RunState::Finished { .. })
    }

    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.status)
    }

    /// Reconstruct a run from its journal
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self::new(first_event.run_id, String::new());
        run.started_at = first_event.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single journal event
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.started_at = event.timestamp;
                if let Some(name) = event.message.strip_prefix("Pipeline '") {
                    self.pipeline_name = name.trim_end_matches("' started").to_string();
                }
            }
            EventType::RunCompleted => {
                self.finish(RunOutcome::Success);
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                let stage = event.stage.clone().unwrap_or_default();
                let reason = match (&event.reason, event.exit_code) {
                    (Some(reason), _) => reason.clone(),
                    (None, Some(code)) if code != TERMINATED_EXIT_CODE => FailureReason::ExitCode(code),
                    (None, _) => FailureReason::Io(event.error.clone().unwrap_or_default()),
                };
                self.finish(RunOutcome::Failed { stage, reason });
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.finish(RunOutcome::Cancelled);
                self.completed_at = Some(event.timestamp);
            }
            EventType::StageStarted => {
                if let Some(ref stage) = event.stage {
                    let index = self.stages.len();
                    self.enter_stage(index);
                    self.record_stage(stage, StageStatus::Running, None, None);
                }
            }
            EventType::StageSkipped
            | EventType::StageCompleted
            | EventType::StageWarned
            | EventType::StageFailed
            | EventType::StageTimedOut => {
                if let Some(ref stage) = event.stage {
                    self.record_stage(stage, event.status, event.exit_code, event.duration_ms);
                }
            }
        }
    }
}
