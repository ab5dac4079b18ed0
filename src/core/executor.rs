//! Process execution for a single stage.
//!
//! `ProcessExecutor` spawns the stage's invocation with piped stdout/stderr,
//! attaches an `OutputDrain`, and waits for one of three things: the process
//! exits, the stage timeout elapses, or the run is cancelled. Every path
//! reaps (or kills) the process and settles the drain before returning.
//!
//! On unix each stage leads its own process group. Terminal signals aimed at
//! the runner do not reach it, and whatever it forked is stopped along with
//! it, so nothing started by a stage outlives `execute`.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, instrument, warn};

use crate::domain::StageDescriptor;
use crate::sinks::LogSink;

use super::cancel::CancelToken;
use super::drain::{DrainPolicy, OutputDrain};

/// Default wait between the graceful terminate request and the forced kill
pub const TERMINATE_GRACE_MS: u64 = 500;

/// Poll interval while waiting for a terminated process group to empty
#[cfg(unix)]
const GROUP_POLL: Duration = Duration::from_millis(20);

/// How a stage process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// Exited on its own with this code
    Exited(i32),

    /// Killed by a signal nobody in this process sent
    Terminated,

    /// Outlived its timeout and was terminated
    TimedOut { limit: Duration },

    /// The run was cancelled while the process was running
    Cancelled,
}

/// Failures to launch or supervise a stage process
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Stage '{stage}' has an empty invocation")]
    EmptyInvocation { stage: String },

    #[error("Failed to start '{program}' for stage '{stage}': {source}")]
    Spawn {
        stage: String,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for stage '{stage}': {source}")]
    Wait {
        stage: String,
        #[source]
        source: io::Error,
    },
}

/// Runs one stage to completion or forced termination
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        stage: &StageDescriptor,
        log: Arc<dyn LogSink>,
        cancel: &CancelToken,
    ) -> Result<StageExit, ExecError>;
}

/// Executor backed by real operating-system processes
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    drain: DrainPolicy,
    terminate_grace: Option<Duration>,
    working_dir: Option<PathBuf>,
}

#[derive(Debug)]
enum Waited {
    Exited(io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = Some(grace);
        self
    }

    /// Run every stage process from this directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn terminate_grace(&self) -> Duration {
        self.terminate_grace
            .unwrap_or(Duration::from_millis(TERMINATE_GRACE_MS))
    }

    #[instrument(skip(self, stage, log, cancel), fields(stage = %stage.name))]
    async fn run_process(
        &self,
        stage: &StageDescriptor,
        log: Arc<dyn LogSink>,
        cancel: &CancelToken,
    ) -> Result<StageExit, ExecError> {
        let program = stage.program().ok_or_else(|| ExecError::EmptyInvocation {
            stage: stage.name.clone(),
        })?;

        let mut command = Command::new(program);
        command
            .args(stage.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                log.append(&format!("An error occurred: {}", source));
                return Err(ExecError::Spawn {
                    stage: stage.name.clone(),
                    program: program.to_string(),
                    source,
                });
            }
        };
        // Also the process group id; `child.id()` is gone once reaped.
        let group = child.id();
        debug!(pid = group, "Stage process started");

        let drain = OutputDrain::spawn(
            &stage.name,
            child.stdout.take(),
            child.stderr.take(),
            log.clone(),
        );

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            waited = wait_with_timeout(&mut child, stage.timeout()) => waited,
        };

        match observe_cancel(waited, cancel.is_cancelled()) {
            Waited::Exited(Ok(status)) => {
                self.terminate(&mut child, group).await;
                let drained = drain.finish(self.drain).await;
                debug!(?status, ?drained, "Stage process exited");
                Ok(exit_from_status(status))
            }
            Waited::Exited(Err(source)) => {
                log.append(&format!("An error occurred: {}", source));
                self.terminate(&mut child, group).await;
                drain.interrupt(self.drain.interrupt_wait).await;
                Err(ExecError::Wait {
                    stage: stage.name.clone(),
                    source,
                })
            }
            Waited::TimedOut(limit) => {
                self.terminate(&mut child, group).await;
                log.append(&format!("{} execution timed out.", stage.name));
                let drained = drain.finish(self.drain).await;
                debug!(?drained, "Timed out stage stopped");
                Ok(StageExit::TimedOut { limit })
            }
            Waited::Cancelled => {
                log.append("Canceled by user");
                self.terminate(&mut child, group).await;
                let drained = drain.interrupt(self.drain.interrupt_wait).await;
                debug!(?drained, "Cancelled stage stopped");
                Ok(StageExit::Cancelled)
            }
        }
    }

    /// Stop the process and anything left in its process group.
    ///
    /// The group gets SIGTERM, then SIGKILL if any member is still alive
    /// after the terminate grace. The leader is always reaped. Also called
    /// after a normal exit, to clear out orphaned descendants.
    async fn terminate(&self, child: &mut Child, group: Option<u32>) {
        #[cfg(unix)]
        {
            if let Some(pgid) = group.filter(|&pgid| signal_group(pgid, libc::SIGTERM)) {
                let deadline = Instant::now() + self.terminate_grace();
                if let Ok(Ok(status)) = timeout_at(deadline, child.wait()).await {
                    debug!(?status, "Stage process stopped after terminate request");
                }
                while group_alive(pgid) && Instant::now() < deadline {
                    tokio::time::sleep(GROUP_POLL).await;
                }
                if group_alive(pgid) {
                    debug!(pgid, "Process group still alive, killing");
                    signal_group(pgid, libc::SIGKILL);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = group;

        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        debug!("Stage process still alive, killing");
        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill stage process");
        }
    }
}

/// Send `signal` to every process in the group. False if the group is gone.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> bool {
    // SAFETY: `pgid` names a group created for our own child; killpg has no
    // memory-safety preconditions.
    unsafe { libc::killpg(pgid as libc::pid_t, signal) == 0 }
}

#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    signal_group(pgid, 0)
}

/// A process killed by the same interrupt that cancelled the run counts as
/// cancelled, not failed.
fn observe_cancel(waited: Waited, cancelled: bool) -> Waited {
    match waited {
        Waited::Exited(Ok(_)) if cancelled => Waited::Cancelled,
        other => other,
    }
}

fn exit_from_status(status: ExitStatus) -> StageExit {
    match status.code() {
        Some(code) => StageExit::Exited(code),
        None => StageExit::Terminated,
    }
}

async fn wait_with_timeout(child: &mut Child, limit: Option<Duration>) -> Waited {
    match limit {
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(result) => Waited::Exited(result),
            Err(_) => Waited::TimedOut(limit),
        },
        None => Waited::Exited(child.wait().await),
    }
}

#[async_trait]
impl StageExecutor for ProcessExecutor {
    async fn execute(
        &self,
        stage: &StageDescriptor,
        log: Arc<dyn LogSink>,
        cancel: &CancelToken,
    ) -> Result<StageExit, ExecError> {
        self.run_process(stage, log, cancel).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sinks::MemoryLogSink;
    use std::time::Instant;

    fn sh(name: &str, script: &str) -> StageDescriptor {
        StageDescriptor::new(name, vec!["sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_exit_code_is_returned() {
        let sink = Arc::new(MemoryLogSink::new());
        let exit = ProcessExecutor::new()
            .execute(&sh("fail", "echo nope; exit 3"), sink.clone(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(exit, StageExit::Exited(3));
        assert_eq!(sink.lines(), vec!["fail output: nope"]);
    }

    #[tokio::test]
    async fn test_stderr_is_drained() {
        let sink = Arc::new(MemoryLogSink::new());
        let exit = ProcessExecutor::new()
            .execute(&sh("warn", "echo oops >&2"), sink.clone(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(exit, StageExit::Exited(0));
        assert!(sink.contains("warn output: oops"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_logged() {
        let sink = Arc::new(MemoryLogSink::new());
        let stage = StageDescriptor::new("missing", vec!["/nonexistent/interpreter".into()]);

        let result = ProcessExecutor::new()
            .execute(&stage, sink.clone(), &CancelToken::new())
            .await;

        assert!(matches!(result, Err(ExecError::Spawn { .. })));
        assert!(sink.contains("An error occurred:"));
    }

    #[tokio::test]
    async fn test_empty_invocation_is_rejected() {
        let sink = Arc::new(MemoryLogSink::new());
        let stage = StageDescriptor::new("empty", Vec::new());

        let result = ProcessExecutor::new()
            .execute(&stage, sink, &CancelToken::new())
            .await;

        assert!(matches!(result, Err(ExecError::EmptyInvocation { .. })));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let sink = Arc::new(MemoryLogSink::new());
        let stage = sh("main", "sleep 30").with_timeout_seconds(1);

        let start = Instant::now();
        let exit = ProcessExecutor::new()
            .execute(&stage, sink.clone(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(exit, StageExit::TimedOut { limit: Duration::from_secs(1) });
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(sink.contains("main execution timed out."));
    }

    #[tokio::test]
    async fn test_term_ignoring_process_is_killed() {
        let sink = Arc::new(MemoryLogSink::new());
        let stage = sh("stubborn", "trap '' TERM; while true; do sleep 1; done").with_timeout_seconds(1);

        let exit = ProcessExecutor::new()
            .with_terminate_grace(Duration::from_millis(100))
            .with_drain_policy(DrainPolicy {
                grace: Duration::from_millis(200),
                interrupt_wait: Duration::from_millis(200),
            })
            .execute(&stage, sink, &CancelToken::new())
            .await
            .unwrap();

        assert!(matches!(exit, StageExit::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_cancel_terminates_process() {
        let sink = Arc::new(MemoryLogSink::new());
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let exit = ProcessExecutor::new()
            .execute(&sh("stringObfuscate", "sleep 30"), sink.clone(), &cancel)
            .await
            .unwrap();

        assert_eq!(exit, StageExit::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(sink.matching("Canceled by user").len(), 1);
    }

    /// Whether `pid` names a live (non-zombie) process
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn stopped_soon(pid: u32) -> bool {
        for _ in 0..25 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    fn read_pid(path: &std::path::Path) -> u32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stage_leads_its_own_process_group() {
        let sink = Arc::new(MemoryLogSink::new());
        let stage = sh("group", r#"echo "$$ $(cut -d' ' -f5 /proc/$$/stat)""#);

        ProcessExecutor::new()
            .execute(&stage, sink.clone(), &CancelToken::new())
            .await
            .unwrap();

        let line = sink.lines().pop().unwrap();
        let ids: Vec<_> = line.trim_start_matches("group output: ").split(' ').collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1], "stage must lead its own process group");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_stops_descendants() {
        let temp = tempfile::TempDir::new().unwrap();
        let pid_file = temp.path().join("child.pid");
        let sink = Arc::new(MemoryLogSink::new());
        let stage = sh(
            "main",
            &format!("sleep 37 & echo $! > '{}'; wait", pid_file.display()),
        )
        .with_timeout_seconds(1);

        let start = Instant::now();
        let exit = ProcessExecutor::new()
            .execute(&stage, sink.clone(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(exit, StageExit::TimedOut { limit: Duration::from_secs(1) });
        // No waiting out the drain grace on a pipe held by the descendant.
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(!sink.contains("still running after"));
        assert!(stopped_soon(read_pid(&pid_file)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_stops_descendants() {
        let temp = tempfile::TempDir::new().unwrap();
        let pid_file = temp.path().join("child.pid");
        let sink = Arc::new(MemoryLogSink::new());
        let stage = sh(
            "stringObfuscate",
            &format!("sleep 37 & echo $! > '{}'; wait", pid_file.display()),
        );

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let exit = ProcessExecutor::new()
            .execute(&stage, sink, &cancel)
            .await
            .unwrap();

        assert_eq!(exit, StageExit::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(stopped_soon(read_pid(&pid_file)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_term_ignoring_descendant_is_killed() {
        let temp = tempfile::TempDir::new().unwrap();
        let pid_file = temp.path().join("stubborn.pid");
        let script = temp.path().join("stubborn.sh");
        std::fs::write(
            &script,
            format!(
                "trap '' TERM\necho $$ > '{}'\nwhile true; do sleep 1; done\n",
                pid_file.display()
            ),
        )
        .unwrap();
        let stage = sh("main", &format!("sh '{}' & wait", script.display())).with_timeout_seconds(1);

        let exit = ProcessExecutor::new()
            .with_terminate_grace(Duration::from_millis(100))
            .execute(&stage, Arc::new(MemoryLogSink::new()), &CancelToken::new())
            .await
            .unwrap();

        assert!(matches!(exit, StageExit::TimedOut { .. }));
        assert!(stopped_soon(read_pid(&pid_file)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_orphan_is_stopped_after_normal_exit() {
        let temp = tempfile::TempDir::new().unwrap();
        let pid_file = temp.path().join("orphan.pid");
        let sink = Arc::new(MemoryLogSink::new());
        // The stage exits at once; its background child keeps stdout open.
        let stage = sh(
            "removeComments",
            &format!("sleep 37 & echo $! > '{}'; echo started", pid_file.display()),
        );

        let start = Instant::now();
        let exit = ProcessExecutor::new()
            .execute(&stage, sink.clone(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(exit, StageExit::Exited(0));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(sink.contains("removeComments output: started"));
        assert!(!sink.contains("still running after"));
        assert!(stopped_soon(read_pid(&pid_file)).await);
    }

    #[test]
    fn test_exit_seen_after_cancel_counts_as_cancelled() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait status 2: killed by SIGINT.
        let interrupted = || Waited::Exited(Ok(ExitStatus::from_raw(2)));

        assert!(matches!(observe_cancel(interrupted(), true), Waited::Cancelled));
        match observe_cancel(interrupted(), false) {
            Waited::Exited(Ok(status)) => assert_eq!(exit_from_status(status), StageExit::Terminated),
            other => panic!("expected exit, got {:?}", other),
        }
        assert!(matches!(
            observe_cancel(Waited::TimedOut(Duration::from_secs(1)), true),
            Waited::TimedOut(_)
        ));
    }

    #[tokio::test]
    async fn test_working_dir_is_applied() {
        let temp = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(MemoryLogSink::new());

        ProcessExecutor::new()
            .with_working_dir(temp.path())
            .execute(&sh("pwd", "pwd"), sink.clone(), &CancelToken::new())
            .await
            .unwrap();

        let expected = temp.path().canonicalize().unwrap();
        let line = sink.lines().pop().unwrap();
        let reported = line.trim_start_matches("pwd output: ");
        assert_eq!(std::path::Path::new(reported).canonicalize().unwrap(), expected);
    }
}
