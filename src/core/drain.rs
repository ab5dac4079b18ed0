//! Output draining for stage processes.
//!
//! Each running stage gets exactly one drain task. It reads the process's
//! stdout and stderr line by line and forwards every line, tagged with the
//! stage name, to the log sink. Read errors are logged and end the drain;
//! they never fail the stage.
//!
//! Shutdown is bounded: after the process exits the executor waits
//! `grace` for end-of-stream, then asks the task to stop and waits
//! `interrupt_wait`, then abandons it with a warning.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::sinks::LogSink;

/// Default wait for the drain to reach end-of-stream after process exit
pub const DRAIN_GRACE_MS: u64 = 5000;

/// Default wait after an interrupt request before abandoning the drain
pub const DRAIN_INTERRUPT_WAIT_MS: u64 = 1000;

/// Bounds on how long the executor waits for a drain to finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    pub grace: Duration,
    pub interrupt_wait: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(DRAIN_GRACE_MS),
            interrupt_wait: Duration::from_millis(DRAIN_INTERRUPT_WAIT_MS),
        }
    }
}

/// How a drain task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainExit {
    /// Reached end-of-stream (or stopped on a read error) by itself
    Completed,

    /// Stopped after an interrupt request
    Interrupted,

    /// Did not stop in time and was aborted
    Abandoned,
}

/// A running drain task bound to one process
pub struct OutputDrain {
    stage: String,
    handle: JoinHandle<()>,
    interrupt: Option<oneshot::Sender<()>>,
    sink: Arc<dyn LogSink>,
}

impl OutputDrain {
    /// Start draining the given streams into `sink`
    pub fn spawn<O, E>(
        stage: &str,
        stdout: Option<O>,
        stderr: Option<E>,
        sink: Arc<dyn LogSink>,
    ) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        let handle = tokio::spawn(drain_streams(
            stage.to_string(),
            stdout.map(|s| BufReader::new(s).split(b'\n')),
            stderr.map(|s| BufReader::new(s).split(b'\n')),
            sink.clone(),
            interrupt_rx,
        ));

        Self {
            stage: stage.to_string(),
            handle,
            interrupt: Some(interrupt_tx),
            sink,
        }
    }

    /// Wait for the drain after the process has exited.
    ///
    /// Never waits longer than `grace + interrupt_wait`.
    pub async fn finish(mut self, policy: DrainPolicy) -> DrainExit {
        if let Ok(joined) = timeout(policy.grace, &mut self.handle).await {
            self.report_join(joined);
            return DrainExit::Completed;
        }

        self.sink.append(&format!(
            "Output drain for {} is still running after {}ms. Interrupting...",
            self.stage,
            policy.grace.as_millis()
        ));
        self.stop(policy.interrupt_wait).await
    }

    /// Interrupt the drain right away (cancellation path)
    pub async fn interrupt(mut self, wait: Duration) -> DrainExit {
        self.stop(wait).await
    }

    async fn stop(&mut self, wait: Duration) -> DrainExit {
        if let Some(tx) = self.interrupt.take() {
            let _ = tx.send(());
        }

        if let Ok(joined) = timeout(wait, &mut self.handle).await {
            self.report_join(joined);
            return DrainExit::Interrupted;
        }

        self.sink.append(&format!(
            "Output drain for {} could not be interrupted. It may be blocked.",
            self.stage
        ));
        self.handle.abort();
        DrainExit::Abandoned
    }

    fn report_join(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            self.sink
                .append(&format!("Output drain for {} failed: {}", self.stage, e));
        }
    }
}

impl Drop for OutputDrain {
    fn drop(&mut self) {
        // A drain must not outlive its stage, whatever path dropped it.
        self.handle.abort();
    }
}

async fn drain_streams<O, E>(
    stage: String,
    mut stdout: Option<Split<BufReader<O>>>,
    mut stderr: Option<Split<BufReader<E>>>,
    sink: Arc<dyn LogSink>,
    mut interrupt: oneshot::Receiver<()>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    while stdout.is_some() || stderr.is_some() {
        let (segment, from_stdout) = tokio::select! {
            _ = &mut interrupt => {
                debug!(stage = %stage, "Output drain interrupted");
                return;
            }
            segment = next_segment(&mut stdout), if stdout.is_some() => (segment, true),
            segment = next_segment(&mut stderr), if stderr.is_some() => (segment, false),
        };

        match segment {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                let line = line.strip_suffix('\r').unwrap_or(&line);
                sink.append(&format!("{} output: {}", stage, line));
            }
            Ok(None) => {
                if from_stdout {
                    stdout = None;
                } else {
                    stderr = None;
                }
            }
            Err(e) => {
                sink.append(&format!("Error reading output from {}: {}", stage, e));
                return;
            }
        }
    }
}

async fn next_segment<R>(reader: &mut Option<Split<R>>) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    match reader {
        Some(split) => split.next_segment().await,
        None => std::future::pending().await,
    }
}
