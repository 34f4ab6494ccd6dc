use crate::{source::MediaFormat, TaskError};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::Command;
use tracing::debug;

pub const AUDIO_BITRATE_KBPS: u32 = 192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostprocessAction {
    /// Drop the video track and encode the audio as mp3.
    ExtractAudio { bitrate_kbps: u32 },
    /// Copy the streams into a different container.
    Remux,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostprocessOptions {
    pub target_ext: String,
    pub action: PostprocessAction,
}

impl PostprocessOptions {
    /// Work needed to turn `format` into a `target_ext` file, or `None` when
    /// the download can be delivered as is.
    pub fn plan(wants_audio: bool, target_ext: &str, format: &MediaFormat) -> Option<Self> {
        let action = if wants_audio {
            if format.ext == target_ext && !format.has_video {
                return None;
            }
            PostprocessAction::ExtractAudio {
                bitrate_kbps: AUDIO_BITRATE_KBPS,
            }
        } else if format.ext != target_ext {
            PostprocessAction::Remux
        } else {
            return None;
        };
        Some(PostprocessOptions {
            target_ext: target_ext.to_string(),
            action,
        })
    }

    /// Path of the produced file, next to `input`.
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let out = input.with_extension(&self.target_ext);
        if out == input {
            input.with_extension(format!("out.{}", self.target_ext))
        } else {
            out
        }
    }
}

#[async_trait]
pub trait Postprocessor: Send + Sync {
    /// Produce the final file from `input`; returns its path. `input` is left
    /// in place for the caller to clean up.
    async fn postprocess(
        &self,
        input: &Path,
        options: &PostprocessOptions,
    ) -> Result<PathBuf, TaskError>;
}

/// Runs `ffmpeg` for remuxing and audio extraction.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Ffmpeg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Ffmpeg {
            binary: binary.into(),
        }
    }

    fn arguments(input: &Path, output: &Path, action: PostprocessAction) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y", "-i"]
            .into_iter()
            .map(String::from)
            .collect();
        args.push(input.to_string_lossy().into_owned());
        match action {
            PostprocessAction::ExtractAudio { bitrate_kbps } => {
                args.extend(["-vn", "-codec:a", "libmp3lame", "-b:a"].map(String::from));
                args.push(format!("{bitrate_kbps}k"));
            }
            PostprocessAction::Remux => args.extend(["-c", "copy"].map(String::from)),
        }
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Postprocessor for Ffmpeg {
    async fn postprocess(
        &self,
        input: &Path,
        options: &PostprocessOptions,
    ) -> Result<PathBuf, TaskError> {
        let output = options.output_path(input);
        debug!(
            input = %input.display(),
            output = %output.display(),
            action = ?options.action,
            "running ffmpeg"
        );

        let result = Command::new(&self.binary)
            .args(Self::arguments(input, &output, options.action))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                TaskError::Postprocess(format!("failed to run {}: {e}", self.binary.display()))
            })?;

        if !result.status.success() {
            let _ = tokio::fs::remove_file(&output).await;
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output");
            return Err(TaskError::Postprocess(format!(
                "ffmpeg exited with {}: {detail}",
                result.status
            )));
        }
        Ok(output)
    }
}

/// Delivers downloads unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl Postprocessor for Passthrough {
    async fn postprocess(
        &self,
        input: &Path,
        _options: &PostprocessOptions,
    ) -> Result<PathBuf, TaskError> {
        Ok(input.to_path_buf())
    }
}
