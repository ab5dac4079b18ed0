//! In-memory sinks.
//!
//! Handy for embedding the runner in another program (collect the log and
//! render it later) and for asserting on runner output in tests.

use std::sync::Mutex;

use super::{LogSink, ProgressReporter};

/// Collects appended lines
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Lines containing `needle`
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.contains(needle))
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        !self.matching(needle).is_empty()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Collects reported fractions and status texts
#[derive(Debug, Default)]
pub struct MemoryProgress {
    fractions: Mutex<Vec<f64>>,
    texts: Mutex<Vec<String>>,
}

impl MemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fractions(&self) -> Vec<f64> {
        self.fractions.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Last reported fraction
    pub fn last(&self) -> Option<f64> {
        self.fractions().last().copied()
    }
}

impl ProgressReporter for MemoryProgress {
    fn report(&self, fraction: f64) {
        if let Ok(mut fractions) = self.fractions.lock() {
            fractions.push(fraction);
        }
    }

    fn set_text(&self, text: &str) {
        if let Ok(mut texts) = self.texts.lock() {
            texts.push(text.to_string());
        }
    }
}
