//! Append-only run journal with file-based persistence.
//!
//! Each run gets a directory `<runs_dir>/<run_id>/` holding `events.jsonl`
//! (one JSON event per line) and `output.log` (the plain log of the run).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, PipelineRun};

const EVENTS_FILE: &str = "events.jsonl";
const OUTPUT_LOG: &str = "output.log";

/// File-based journal for one run
#[derive(Debug, Clone)]
pub struct RunJournal {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl RunJournal {
    /// Create or open the journal for a run
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        Ok(Self {
            events_path: run_dir.join(EVENTS_FILE),
            run_dir,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Where the plain-text output of the run is kept
    pub fn output_log_path(&self) -> PathBuf {
        self.run_dir.join(OUTPUT_LOG)
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Rebuild the run summary from the journal
    pub async fn load_run(&self) -> Result<Option<PipelineRun>> {
        let events = self.replay().await?;
        Ok(PipelineRun::from_events(&events))
    }

    /// List all run IDs under `runs_dir`
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir)
            .await
            .with_context(|| format!("Failed to read runs directory: {}", runs_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }

    /// Load the most recent runs, newest first
    pub async fn recent_runs(runs_dir: &Path, limit: usize) -> Result<Vec<PipelineRun>> {
        let mut runs = Vec::new();

        for run_id in Self::list_runs(runs_dir).await? {
            let journal = Self::open(runs_dir, run_id).await?;
            if let Ok(Some(run)) = journal.load_run().await {
                runs.push(run);
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, StageStatus};
    use tempfile::TempDir;

    fn started(run_id: Uuid, name: &str) -> Event {
        Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!("Pipeline '{}' started", name),
            StageStatus::Running,
        )
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let journal = RunJournal::open(temp.path(), run_id).await.unwrap();

        journal.append(&started(run_id, "obfuscate")).await.unwrap();
        journal
            .append(&Event::new(
                run_id,
                Some("main".to_string()),
                EventType::StageStarted,
                "Analysing code...".to_string(),
                StageStatus::Running,
            ))
            .await
            .unwrap();

        let events = journal.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].event_type, EventType::StageStarted);
        assert_eq!(journal.run_dir(), temp.path().join(run_id.to_string()));
    }

    #[tokio::test]
    async fn test_replay_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let journal = RunJournal::open(temp.path(), Uuid::new_v4()).await.unwrap();

        assert!(journal.replay().await.unwrap().is_empty());
        assert!(journal.load_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_rejects_corrupt_lines() {
        let temp = TempDir::new().unwrap();
        let journal = RunJournal::open(temp.path(), Uuid::new_v4()).await.unwrap();
        std::fs::write(journal.events_path(), "{not json}\n").unwrap();

        assert!(journal.replay().await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_recent_runs() {
        let temp = TempDir::new().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        for (id, name) in [(first, "one"), (second, "two")] {
            let journal = RunJournal::open(temp.path(), id).await.unwrap();
            journal.append(&started(id, name)).await.unwrap();
        }
        // Stray entries are ignored.
        std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();

        let mut ids = RunJournal::list_runs(temp.path()).await.unwrap();
        ids.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(ids, expected);

        let recent = RunJournal::recent_runs(temp.path(), 1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].pipeline_name, "two");
    }

    #[tokio::test]
    async fn test_list_runs_without_directory() {
        let temp = TempDir::new().unwrap();
        let runs = RunJournal::list_runs(&temp.path().join("missing")).await.unwrap();
        assert!(runs.is_empty());
    }
}
