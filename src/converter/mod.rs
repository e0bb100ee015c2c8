pub mod ffmpeg;
pub mod job;
pub mod registry;
#[cfg(all(test, unix))]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use crate::errors::{AppError, Result};

pub const MIN_SAMPLE_RATE: u32 = 8000;
pub const MAX_SAMPLE_RATE: u32 = 48000;

/// Message carried by a job that was stopped on request.
pub const CANCELLED_MESSAGE: &str = "Conversion cancelled";

/// Audio extensions accepted as conversion input (compared case-insensitively).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg", "m4a", "aac"];

/// Target format for a conversion. A job keeps its own copy, so changing the
/// registry's settings never touches work that is already submitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConversionSettings {
    pub sample_rate: u32,
    pub mono: bool,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            mono: true,
        }
    }
}

impl ConversionSettings {
    pub fn new(sample_rate: u32, mono: bool) -> Result<Self> {
        let settings = Self { sample_rate, mono };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(AppError::Validation(format!(
                "Sample rate {} Hz is out of range ({}-{} Hz)",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        Ok(())
    }

    pub fn channels(&self) -> u8 {
        if self.mono { 1 } else { 2 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

/// Events delivered to the presentation shell.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionEvent {
    /// FFmpeg is running for this input.
    Started { input: PathBuf },
    Progress { input: PathBuf, percent: u8 },
    Succeeded { input: PathBuf, output: PathBuf },
    Failed { input: PathBuf, message: String },
    Cancelled { input: PathBuf },
    BatchComplete(BatchSummary),
}

impl ConversionEvent {
    pub fn input(&self) -> Option<&PathBuf> {
        match self {
            ConversionEvent::Started { input }
            | ConversionEvent::Progress { input, .. }
            | ConversionEvent::Succeeded { input, .. }
            | ConversionEvent::Failed { input, .. }
            | ConversionEvent::Cancelled { input } => Some(input),
            ConversionEvent::BatchComplete(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversionEvent::Succeeded { .. }
                | ConversionEvent::Failed { .. }
                | ConversionEvent::Cancelled { .. }
        )
    }
}

/// Outcome of every job that finished since the registry was last idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub cancelled: Vec<PathBuf>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl BatchSummary {
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.cancelled.len()
    }

    /// Human readable report, one line per failure.
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        if !self.succeeded.is_empty() {
            lines.push(format!("Successfully converted {} files.", self.succeeded.len()));
        }
        if !self.cancelled.is_empty() {
            lines.push(format!("Cancelled {} files.", self.cancelled.len()));
        }
        if !self.failed.is_empty() {
            lines.push(format!("Failed to convert {} files:", self.failed.len()));
            for (file, error) in &self.failed {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| file.to_string_lossy().to_string());
                lines.push(format!("- {}: {}", name, error));
            }
        }
        lines.join("\n")
    }
}

impl Default for BatchSummary {
    fn default() -> Self {
        Self::new()
    }
}
