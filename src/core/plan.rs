//! Stage plans and loading.
//!
//! A plan is an ordered list of stages plus the progress schedule used to
//! report completion. Plans are either built from settings (see
//! `obfuscation`) or loaded from YAML.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::StageDescriptor;

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePlan {
    /// Plan name (recorded in the run journal)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// How stage positions map to progress fractions
    #[serde(default)]
    pub progress: ProgressSchedule,

    /// Ordered list of stages to execute
    pub stages: Vec<StageDescriptor>,
}

impl StagePlan {
    pub fn new(name: impl Into<String>, stages: Vec<StageDescriptor>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            progress: ProgressSchedule::default(),
            stages,
        }
    }

    pub fn with_progress(mut self, progress: ProgressSchedule) -> Self {
        self.progress = progress;
        self
    }

    /// Load a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a plan from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the plan definition
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.name.is_empty() {
            return Err(PlanError::EmptyName);
        }

        if self.stages.is_empty() {
            return Err(PlanError::NoStages);
        }

        self.progress.validate()?;

        let mut seen = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                return Err(PlanError::EmptyStageName { index: i });
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(PlanError::DuplicateStage {
                    name: stage.name.clone(),
                });
            }
            if stage.invocation.is_empty() || stage.invocation[0].is_empty() {
                return Err(PlanError::EmptyInvocation {
                    name: stage.name.clone(),
                });
            }
            if stage.timeout_seconds == Some(0) {
                return Err(PlanError::ZeroTimeout {
                    name: stage.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Names of the stages that will actually run
    pub fn enabled_stage_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Maps stage positions to progress fractions.
///
/// Stage 0 reports `start`, stage 1 reports `start + first_step` and every
/// later stage adds `step`, capped at `end`. Disabled stages keep their slot.
/// A successful run finishes at `end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSchedule {
    #[serde(default)]
    pub start: f64,
    #[serde(default = "default_step")]
    pub step: f64,
    /// Gap between the first and second stage; `step` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_step: Option<f64>,
    #[serde(default = "default_end")]
    pub end: f64,
}

fn default_step() -> f64 {
    0.1
}
fn default_end() -> f64 {
    1.0
}

impl Default for ProgressSchedule {
    fn default() -> Self {
        Self::new(0.0, default_step(), default_end())
    }
}

impl ProgressSchedule {
    pub fn new(start: f64, step: f64, end: f64) -> Self {
        Self {
            start,
            step,
            first_step: None,
            end,
        }
    }

    pub fn with_first_step(mut self, first_step: f64) -> Self {
        self.first_step = Some(first_step);
        self
    }

    /// Fraction reported when stage `index` starts (or is skipped)
    pub fn fraction_for(&self, index: usize) -> f64 {
        let fraction = match index {
            0 => self.start,
            n => self.start + self.first_step.unwrap_or(self.step) + self.step * (n - 1) as f64,
        };
        fraction.min(self.end)
    }

    fn validate(&self) -> Result<(), PlanError> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        let first_step = self.first_step.unwrap_or(self.step);
        if !in_range(self.start)
            || !in_range(self.end)
            || self.start > self.end
            || !(self.step >= 0.0)
            || !(first_step >= 0.0)
        {
            return Err(PlanError::InvalidProgress {
                start: self.start,
                step: self.step,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// Invalid plan definitions
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("Pipeline name cannot be empty")]
    EmptyName,

    #[error("Pipeline must have at least one stage")]
    NoStages,

    #[error("Stage {index} has an empty name")]
    EmptyStageName { index: usize },

    #[error("Stage name '{name}' is used more than once")]
    DuplicateStage { name: String },

    #[error("Stage '{name}' has an empty invocation")]
    EmptyInvocation { name: String },

    #[error("Stage '{name}' has a zero timeout")]
    ZeroTimeout { name: String },

    #[error("Invalid progress schedule: start={start}, step={step}, end={end}")]
    InvalidProgress { start: f64, step: f64, end: f64 },

    #[error("Missing helper source: {path}")]
    MissingHelper { path: String },
}
