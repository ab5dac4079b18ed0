//! Sequential pipeline runner.
//!
//! Walks a `StagePlan` in order, one process at a time. Disabled stages are
//! skipped, advisory stages may fail without stopping the run, and any other
//! failure (or a cancellation request) ends the run with a single outcome.
//! Every transition is written to the log sink, the progress reporter and,
//! when configured, the run journal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Event, EventType, FailureReason, PipelineRun, RunOutcome, StageDescriptor, StageStatus,
};
use crate::sinks::{LogSink, ProgressReporter};

use super::cancel::CancelToken;
use super::executor::{ExecError, ProcessExecutor, StageExecutor, StageExit};
use super::journal::RunJournal;
use super::plan::StagePlan;

/// Executes stage plans against an executor
pub struct PipelineRunner<E = ProcessExecutor> {
    executor: E,
    log: Arc<dyn LogSink>,
    progress: Arc<dyn ProgressReporter>,

    /// Where run journals are written, if anywhere
    runs_dir: Option<PathBuf>,
}

/// What the runner does after a stage settles
enum Verdict {
    Continue,
    Stop(RunOutcome),
}

impl<E: StageExecutor> PipelineRunner<E> {
    pub fn new(executor: E, log: Arc<dyn LogSink>, progress: Arc<dyn ProgressReporter>) -> Self {
        Self {
            executor,
            log,
            progress,
            runs_dir: None,
        }
    }

    /// Record each run under `runs_dir/<run_id>/events.jsonl`
    pub fn with_journal_dir(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Run a plan under a fresh run id
    pub async fn run(&self, plan: &StagePlan, cancel: &CancelToken) -> PipelineRun {
        self.run_with_id(Uuid::new_v4(), plan, cancel).await
    }

    /// Run a plan to completion, failure or cancellation.
    ///
    /// Stages execute strictly one after another; the next stage never starts
    /// before the previous process has been reaped.
    #[instrument(skip(self, plan, cancel), fields(pipeline = %plan.name))]
    pub async fn run_with_id(
        &self,
        run_id: Uuid,
        plan: &StagePlan,
        cancel: &CancelToken,
    ) -> PipelineRun {
        info!("Starting pipeline execution");

        let journal = self.open_journal(run_id).await;
        let mut run = PipelineRun::new(run_id, plan.name.clone());

        self.record(
            journal.as_ref(),
            Event::new(
                run_id,
                None,
                EventType::RunStarted,
                format!("Pipeline '{}' started", plan.name),
                StageStatus::Running,
            ),
        )
        .await;

        for (index, stage) in plan.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                self.log.append("Canceled by user");
                return self
                    .finish(journal.as_ref(), run, RunOutcome::Cancelled, None)
                    .await;
            }

            run.enter_stage(index);
            let fraction = run.advance_progress(plan.progress.fraction_for(index));
            self.progress.report(fraction);

            if !stage.enabled {
                self.skip_stage(journal.as_ref(), &mut run, stage).await;
                continue;
            }

            match self
                .execute_stage(journal.as_ref(), &mut run, stage, cancel)
                .await
            {
                Verdict::Continue => {}
                Verdict::Stop(outcome) => {
                    return self
                        .finish(journal.as_ref(), run, outcome, Some(stage.name.as_str()))
                        .await;
                }
            }
        }

        let fraction = run.advance_progress(plan.progress.end);
        self.progress.report(fraction);

        self.finish(journal.as_ref(), run, RunOutcome::Success, None)
            .await
    }

    async fn skip_stage(
        &self,
        journal: Option<&RunJournal>,
        run: &mut PipelineRun,
        stage: &StageDescriptor,
    ) {
        let message = format!("Skipping {} (disabled in configuration)", stage.name);
        debug!(stage = %stage.name, "Stage disabled");
        self.log.append(&message);

        run.record_stage(&stage.name, StageStatus::Skipped, None, None);
        self.record(
            journal,
            Event::new(
                run.id,
                Some(stage.name.clone()),
                EventType::StageSkipped,
                message,
                StageStatus::Skipped,
            ),
        )
        .await;
    }

    #[instrument(skip(self, journal, run, stage, cancel), fields(stage = %stage.name))]
    async fn execute_stage(
        &self,
        journal: Option<&RunJournal>,
        run: &mut PipelineRun,
        stage: &StageDescriptor,
        cancel: &CancelToken,
    ) -> Verdict {
        let label = format!("{}...", stage.display_label());
        self.progress.set_text(&label);
        self.log.append(&label);

        run.record_stage(&stage.name, StageStatus::Running, None, None);
        self.record(
            journal,
            Event::new(
                run.id,
                Some(stage.name.clone()),
                EventType::StageStarted,
                label,
                StageStatus::Running,
            ),
        )
        .await;

        let started = Instant::now();
        let result = self
            .executor
            .execute(stage, self.log.clone(), cancel)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(StageExit::Exited(0)) => {
                let message = stage
                    .success_message
                    .clone()
                    .unwrap_or_else(|| format!("{} completed", stage.name));
                self.log.append(&message);
                info!(duration_ms, "Stage completed");

                run.record_stage(&stage.name, StageStatus::Completed, Some(0), Some(duration_ms));
                self.record(
                    journal,
                    Event::new(
                        run.id,
                        Some(stage.name.clone()),
                        EventType::StageCompleted,
                        message,
                        StageStatus::Completed,
                    )
                    .with_exit_code(0)
                    .with_duration(duration_ms),
                )
                .await;
                Verdict::Continue
            }
            Ok(StageExit::Exited(code)) => {
                self.stage_failed(journal, run, stage, FailureReason::ExitCode(code), duration_ms)
                    .await
            }
            Ok(StageExit::Terminated) => {
                self.stage_failed(journal, run, stage, FailureReason::Terminated, duration_ms)
                    .await
            }
            Ok(StageExit::TimedOut { limit }) => {
                let reason = FailureReason::TimedOut {
                    limit_seconds: limit.as_secs(),
                };
                self.stage_failed(journal, run, stage, reason, duration_ms)
                    .await
            }
            Ok(StageExit::Cancelled) => {
                run.record_stage(&stage.name, StageStatus::Cancelled, None, Some(duration_ms));
                Verdict::Stop(RunOutcome::Cancelled)
            }
            Err(e) => self.stage_errored(journal, run, stage, e, duration_ms).await,
        }
    }

    async fn stage_failed(
        &self,
        journal: Option<&RunJournal>,
        run: &mut PipelineRun,
        stage: &StageDescriptor,
        reason: FailureReason,
        duration_ms: u64,
    ) -> Verdict {
        if stage.is_advisory() {
            let message = format!("{} reported a problem ({}); continuing", stage.name, reason);
            warn!(%reason, "Advisory stage failed");
            self.log.append(&message);
            if let Some(ref notice) = stage.notice {
                for line in notice.lines() {
                    self.log.append(line);
                }
            }

            run.record_stage(
                &stage.name,
                StageStatus::Warned,
                Some(reason.exit_code()),
                Some(duration_ms),
            );
            self.record(
                journal,
                Event::new(
                    run.id,
                    Some(stage.name.clone()),
                    EventType::StageWarned,
                    message,
                    StageStatus::Warned,
                )
                .with_reason(reason)
                .with_duration(duration_ms),
            )
            .await;
            return Verdict::Continue;
        }

        // The executor already logged the timeout line.
        let (event_type, message) = match reason {
            FailureReason::ExitCode(code) => (
                EventType::StageFailed,
                format!("{} failed with exit code {}", stage.name, code),
            ),
            FailureReason::TimedOut { .. } => (
                EventType::StageTimedOut,
                format!("{} execution timed out.", stage.name),
            ),
            FailureReason::Terminated => (
                EventType::StageFailed,
                format!("{} was terminated by a signal", stage.name),
            ),
            FailureReason::Io(ref e) => (
                EventType::StageFailed,
                format!("{} failed: {}", stage.name, e),
            ),
        };
        if event_type == EventType::StageFailed {
            self.log.append(&message);
        }
        error!(%reason, "Stage failed");

        run.record_stage(
            &stage.name,
            StageStatus::Failed,
            Some(reason.exit_code()),
            Some(duration_ms),
        );
        self.record(
            journal,
            Event::new(
                run.id,
                Some(stage.name.clone()),
                event_type,
                message,
                StageStatus::Failed,
            )
            .with_reason(reason.clone())
            .with_duration(duration_ms),
        )
        .await;

        Verdict::Stop(RunOutcome::Failed {
            stage: stage.name.clone(),
            reason,
        })
    }

    /// Launch or supervision errors end the run, advisory stage or not.
    async fn stage_errored(
        &self,
        journal: Option<&RunJournal>,
        run: &mut PipelineRun,
        stage: &StageDescriptor,
        err: ExecError,
        duration_ms: u64,
    ) -> Verdict {
        error!(error = %err, "Stage could not be executed");
        let reason = FailureReason::Io(err.to_string());

        run.record_stage(
            &stage.name,
            StageStatus::Failed,
            Some(reason.exit_code()),
            Some(duration_ms),
        );
        self.record(
            journal,
            Event::new(
                run.id,
                Some(stage.name.clone()),
                EventType::StageFailed,
                err.to_string(),
                StageStatus::Failed,
            )
            .with_reason(reason.clone())
            .with_duration(duration_ms),
        )
        .await;

        Verdict::Stop(RunOutcome::Failed {
            stage: stage.name.clone(),
            reason,
        })
    }

    async fn finish(
        &self,
        journal: Option<&RunJournal>,
        mut run: PipelineRun,
        outcome: RunOutcome,
        stage: Option<&str>,
    ) -> PipelineRun {
        let event = match &outcome {
            RunOutcome::Success => {
                info!(run_id = %run.id, "Pipeline completed successfully");
                Event::new(
                    run.id,
                    None,
                    EventType::RunCompleted,
                    format!("Pipeline '{}' completed", run.pipeline_name),
                    StageStatus::Completed,
                )
            }
            RunOutcome::Failed { reason, .. } => {
                error!(run_id = %run.id, %outcome, "Pipeline failed");
                Event::new(
                    run.id,
                    stage.map(str::to_string),
                    EventType::RunFailed,
                    format!("Pipeline '{}' {}", run.pipeline_name, outcome),
                    StageStatus::Failed,
                )
                .with_reason(reason.clone())
            }
            RunOutcome::Cancelled => {
                warn!(run_id = %run.id, "Pipeline cancelled");
                Event::new(
                    run.id,
                    stage.map(str::to_string),
                    EventType::RunCancelled,
                    "Canceled by user".to_string(),
                    StageStatus::Cancelled,
                )
            }
        };

        run.finish(outcome);
        self.record(journal, event).await;
        run
    }

    async fn open_journal(&self, run_id: Uuid) -> Option<RunJournal> {
        let runs_dir = self.runs_dir.as_ref()?;
        match RunJournal::open(runs_dir, run_id).await {
            Ok(journal) => Some(journal),
            Err(e) => {
                warn!(error = %e, "Run journal unavailable, continuing without it");
                None
            }
        }
    }

    /// Journal writes never change the outcome of a run.
    async fn record(&self, journal: Option<&RunJournal>, event: Event) {
        if let Some(journal) = journal {
            if let Err(e) = journal.append(&event).await {
                warn!(error = %e, "Failed to append run event");
            }
        }
    }
}
