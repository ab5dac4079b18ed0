//! The TaintBomb obfuscation plan.
//!
//! Turns feature settings into the fixed stage sequence:
//!
//! | stage                 | enabled when             | notes                     |
//! |-----------------------|--------------------------|---------------------------|
//! | `checkJavaSyntax`     | always                   | advisory, reads sources   |
//! | `removeComments`      | `remove_comments`        |                           |
//! | `stringObfuscate`     | `string_encryption`      | decrypt helper sources    |
//! | `main`                | always                   | analysis, 60s timeout     |
//! | `levelObfuscate`      | always                   |                           |
//! | `identifierObfuscate` | `identifier_obfuscation` |                           |
//!
//! Every stage runs `<interpreter> -u <scripts>/<stage>.py <target> [args]`.

use std::path::{Path, PathBuf};

use crate::config::{ObfuscationSettings, ResolvedConfig};
use crate::domain::StageDescriptor;

use super::plan::{PlanError, ProgressSchedule, StagePlan};

/// Timeout for the analysis stage
pub const ANALYSIS_TIMEOUT_SECONDS: u64 = 60;

/// Progress reported when the first stage starts
pub const PROGRESS_START: f64 = 0.30;

/// Gap between the syntax check and the first transforming stage
pub const PROGRESS_FIRST_STEP: f64 = 0.05;

/// Progress increment per stage after that
pub const PROGRESS_STEP: f64 = 0.08;

const SYNTAX_NOTICE: &str = "JavaSyntaxError.

!!!!!!   CODE SYNTAX IS NOT SUPPORTED   !!!!!!
The code must be based on the Java language spec available at:
http://docs.oracle.com/javase/specs/jls/se8/html/

The process will continue, but the result may be wrong.";

/// Platform flavour of the string-decrypt helper sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperOs {
    Windows,
    Mac,
    Linux,
}

impl HelperOs {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Self::Windows,
            "macos" => Self::Mac,
            _ => Self::Linux,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Windows => "Windows",
            Self::Mac => "Mac",
            Self::Linux => "Linux",
        }
    }
}

/// Builds the obfuscation `StagePlan` from settings
#[derive(Debug, Clone)]
pub struct ObfuscationPlan {
    interpreter: String,
    scripts_dir: PathBuf,
    settings: ObfuscationSettings,
    os: HelperOs,
}

impl ObfuscationPlan {
    pub fn new(
        interpreter: impl Into<String>,
        scripts_dir: impl Into<PathBuf>,
        settings: ObfuscationSettings,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            scripts_dir: scripts_dir.into(),
            settings,
            os: HelperOs::current(),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(
            config.interpreter.clone(),
            config.scripts_dir.clone(),
            config.settings.clone(),
        )
    }

    pub fn with_os(mut self, os: HelperOs) -> Self {
        self.os = os;
        self
    }

    /// Build the stage list for one source tree and output directory
    pub fn build(&self, source_dir: &Path, output_dir: &Path) -> Result<StagePlan, PlanError> {
        let features = &self.settings.features;
        let out = output_dir.to_string_lossy().to_string();
        let level_flags = [
            features.operator_obfuscation.to_string(),
            features.method_splitting.to_string(),
            features.insert_dummy_code.to_string(),
        ];

        let syntax = self
            .stage("checkJavaSyntax", source_dir.to_string_lossy().as_ref(), &[])
            .with_label("Checking Java code syntax")
            .advisory(Some(SYNTAX_NOTICE.to_string()))
            .with_success_message("This code is supported");

        let remove_comments = self
            .stage("removeComments", &out, &[])
            .with_label("Removing comments")
            .with_enabled(features.remove_comments);

        // Helper sources are only needed (and only required) when enabled.
        let string_args = if features.string_encryption {
            vec![
                self.read_helper("keyDecrypt")?,
                self.read_helper("stringDecrypt")?,
            ]
        } else {
            Vec::new()
        };
        let string_obfuscate = self
            .stage("stringObfuscate", &out, &string_args)
            .with_label("Encrypting strings")
            .with_enabled(features.string_encryption);

        let mut analysis_args = vec![self.settings.api_key.clone()];
        analysis_args.extend(level_flags.iter().cloned());
        let analysis = self
            .stage("main", &out, &analysis_args)
            .with_label("Analysing code")
            .with_timeout_seconds(ANALYSIS_TIMEOUT_SECONDS);

        let level = self
            .stage("levelObfuscate", &out, &level_flags)
            .with_label("Running differential obfuscating");

        let identifier = self
            .stage("identifierObfuscate", &out, &[])
            .with_label("Identifier obfuscating")
            .with_enabled(features.identifier_obfuscation);

        let mut plan = StagePlan::new(
            "obfuscate",
            vec![syntax, remove_comments, string_obfuscate, analysis, level, identifier],
        )
        .with_progress(
            ProgressSchedule::new(PROGRESS_START, PROGRESS_STEP, 1.0)
                .with_first_step(PROGRESS_FIRST_STEP),
        );
        plan.description = format!("Obfuscate {}", source_dir.display());

        Ok(plan)
    }

    fn script_path(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(format!("{}.py", name))
    }

    fn stage(&self, name: &str, target: &str, extra: &[String]) -> StageDescriptor {
        let mut invocation = vec![
            self.interpreter.clone(),
            "-u".to_string(),
            self.script_path(name).to_string_lossy().to_string(),
            target.to_string(),
        ];
        invocation.extend(extra.iter().cloned());
        StageDescriptor::new(name, invocation)
    }

    fn read_helper(&self, base: &str) -> Result<String, PlanError> {
        let path = self
            .scripts_dir
            .join("java")
            .join(format!("{}{}.java", base, self.os.suffix()));

        std::fs::read_to_string(&path).map_err(|_| PlanError::MissingHelper {
            path: path.display().to_string(),
        })
    }
}
