use crate::{ErrorKind, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    FetchingInfo,
    Downloading,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a worker currently owns the task.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            TaskStatus::FetchingInfo | TaskStatus::Downloading | TaskStatus::Processing
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, FetchingInfo | Cancelled) => true,
            (FetchingInfo, Downloading | Failed | Cancelled) => true,
            (Downloading, Processing | Failed | Cancelled) => true,
            (Processing, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::FetchingInfo => "fetching_info",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested output kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Webm,
    Mkv,
    /// Audio track only, delivered as mp3.
    Audio,
    /// mp4 capped at 480p.
    Mobile,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp4 | OutputFormat::Mobile => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Mkv => "mkv",
            OutputFormat::Audio => "mp3",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, OutputFormat::Audio)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" | "video" => Ok(OutputFormat::Mp4),
            "webm" => Ok(OutputFormat::Webm),
            "mkv" => Ok(OutputFormat::Mkv),
            "audio" | "mp3" => Ok(OutputFormat::Audio),
            "mobile" => Ok(OutputFormat::Mobile),
            other => Err(format!("unknown format '{other}'")),
        }
    }
}

/// Requested resolution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    #[serde(rename = "best")]
    Best,
    #[serde(rename = "worst")]
    Worst,
    #[serde(rename = "2160p")]
    P2160,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
}

impl Quality {
    /// Maximum frame height allowed by this tier, if any.
    pub fn max_height(self) -> Option<u32> {
        match self {
            Quality::Best | Quality::Worst => None,
            Quality::P2160 => Some(2160),
            Quality::P1440 => Some(1440),
            Quality::P1080 => Some(1080),
            Quality::P720 => Some(720),
            Quality::P480 => Some(480),
            Quality::P360 => Some(360),
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "best" => Ok(Quality::Best),
            "worst" => Ok(Quality::Worst),
            "2160p" | "4k" => Ok(Quality::P2160),
            "1440p" => Ok(Quality::P1440),
            "1080p" => Ok(Quality::P1080),
            "720p" => Ok(Quality::P720),
            "480p" => Ok(Quality::P480),
            "360p" => Ok(Quality::P360),
            other => Err(format!("unknown quality '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Retrieval handle of a completed task. `path` points at a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Snapshot of one download request and its progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    url: String,
    format: OutputFormat,
    quality: Quality,
    audio_only: bool,
    created_at: DateTime<Utc>,

    status: TaskStatus,
    title: Option<String>,
    progress: f64,
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    speed: Option<f64>,
    eta: Option<u64>,
    error: Option<TaskFailure>,
    result: Option<TaskResult>,
    updated_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        url: impl Into<String>,
        format: OutputFormat,
        quality: Quality,
        audio_only: bool,
    ) -> Self {
        let now = Utc::now();
        Task {
            id,
            url: url.into(),
            format,
            quality,
            audio_only,
            created_at: now,
            status: TaskStatus::Queued,
            title: None,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: None,
            eta: None,
            error: None,
            result: None,
            updated_at: now,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn audio_only(&self) -> bool {
        self.audio_only
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    /// Recent throughput in bytes per second.
    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    /// Estimated seconds remaining.
    pub fn eta(&self) -> Option<u64> {
        self.eta
    }

    pub fn error(&self) -> Option<&TaskFailure> {
        self.error.as_ref()
    }

    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn transition(&mut self, next: TaskStatus) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::Finished {
                id: self.id,
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    pub(crate) fn set_total_bytes(&mut self, total: Option<u64>) {
        self.total_bytes = total;
    }

    /// Apply a progress sample. Ignored outside `downloading`; neither
    /// `progress` nor `downloaded_bytes` ever move backwards.
    pub(crate) fn record_progress(
        &mut self,
        percent: f64,
        bytes: u64,
        speed: Option<f64>,
        eta: Option<u64>,
    ) -> bool {
        if self.status != TaskStatus::Downloading {
            return false;
        }
        if percent.is_finite() {
            self.progress = self.progress.max(percent.clamp(0.0, 100.0));
        }
        self.downloaded_bytes = self.downloaded_bytes.max(bytes);
        self.speed = speed;
        self.eta = eta;
        self.updated_at = Utc::now();
        true
    }

    pub(crate) fn complete(&mut self, result: TaskResult) -> Result<(), StoreError> {
        self.transition(TaskStatus::Completed)?;
        self.progress = 100.0;
        self.speed = None;
        self.eta = None;
        self.result = Some(result);
        Ok(())
    }

    pub(crate) fn fail(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.transition(TaskStatus::Failed)?;
        self.speed = None;
        self.eta = None;
        self.error = Some(TaskFailure {
            kind,
            message: message.into(),
        });
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Result<(), StoreError> {
        self.transition(TaskStatus::Cancelled)?;
        self.speed = None;
        self.eta = None;
        Ok(())
    }
}
