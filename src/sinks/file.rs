//! Plain-text log file sink.
//!
//! `append` only queues the line. A writer task owns the file and writes
//! through a buffer, flushing whenever the queue runs dry, so drain tasks
//! never block on disk I/O.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::LogSink;

enum Command {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Appends lines to a file from a background writer task
#[derive(Debug)]
pub struct FileLogSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Command>,
}

impl FileLogSink {
    /// Open (or create) the file in append mode and start its writer
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(file, rx, path.to_path_buf()));

        Ok(Self {
            path: path.to_path_buf(),
            tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every line appended so far is on disk
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl LogSink for FileLogSink {
    fn append(&self, line: &str) {
        if self.tx.send(Command::Line(line.to_string())).is_err() {
            warn!(path = %self.path.display(), "Log writer stopped, dropping line");
        }
    }
}

async fn write_lines(file: File, mut rx: mpsc::UnboundedReceiver<Command>, path: PathBuf) {
    let mut writer = BufWriter::new(file);

    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(command) = next.take() {
            match command {
                Command::Line(mut line) => {
                    line.push('\n');
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        warn!(path = %path.display(), error = %e, "Failed to write log line");
                    }
                }
                Command::Flush(done) => {
                    if let Err(e) = writer.flush().await {
                        warn!(path = %path.display(), error = %e, "Failed to flush log file");
                    }
                    let _ = done.send(());
                }
            }
            next = rx.try_recv().ok();
        }

        if let Err(e) = writer.flush().await {
            warn!(path = %path.display(), error = %e, "Failed to flush log file");
        }
    }
}
