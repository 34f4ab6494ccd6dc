use super::{Extractor, MediaFormat, MediaInfo, Transfer, MERGED_CONTAINER};
use crate::{classify, TaskError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, stream, StreamExt, TryStreamExt};
use reqwest::Url;
use serde::Deserialize;
use std::{path::PathBuf, process::Stdio, time::Duration};
use tokio::{io::AsyncReadExt, process::Command};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Extractor backed by the `yt-dlp` command line tool.
///
/// Metadata comes from `yt-dlp -J`; the transfer streams the selected format
/// from the tool's stdout. The child process is killed when the stream is
/// dropped.
#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: PathBuf,
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        YtDlpExtractor {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--no-warnings", "--no-playlist"])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn fetch_metadata(&self, url: &Url) -> Result<MediaInfo, TaskError> {
        let output = self.command().arg("-J").arg(url.as_str()).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(%url, status = %output.status, "yt-dlp metadata lookup failed");
            return Err(classify(&stderr));
        }
        parse_info(&output.stdout)
    }

    async fn open(&self, url: &Url, format: &MediaFormat) -> Result<Transfer, TaskError> {
        let mut cmd = self.command();
        cmd.args(["--quiet", "-f", format.format_id.as_str(), "-o", "-"]);
        if format.is_merged() {
            // yt-dlp pipes the merge through ffmpeg.
            cmd.args(["--merge-output-format", MERGED_CONTAINER]);
        }
        let mut child = cmd
            .arg(url.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::Transfer("yt-dlp stdout was not captured".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::Transfer("yt-dlp stderr was not captured".into()))?;

        let diagnostics = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let body = ReaderStream::new(stdout).map_err(TaskError::from);
        let exit = stream::once(async move {
            let status = child.wait().await?;
            if status.success() {
                return Ok::<Option<Bytes>, TaskError>(None);
            }
            let stderr = diagnostics.await.unwrap_or_default();
            Err(classify(&stderr))
        })
        .try_filter_map(|none| future::ready(Ok(none)));

        Ok(Transfer {
            total_bytes: format.size_hint(),
            stream: body.chain(exit).boxed(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    #[serde(rename = "_type")]
    kind: Option<String>,
    id: String,
    title: Option<String>,
    duration: Option<f64>,
    is_live: Option<bool>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    ext: String,
    height: Option<u32>,
    tbr: Option<f64>,
    abr: Option<f64>,
    filesize: Option<u64>,
    filesize_approx: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
}

impl RawFormat {
    fn into_format(self) -> MediaFormat {
        let has_video = match self.vcodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.height.is_some(),
        };
        let has_audio = match self.acodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.vcodec.is_none(),
        };
        MediaFormat {
            format_id: self.format_id,
            ext: self.ext,
            height: self.height,
            bitrate: self.tbr.or(self.abr),
            filesize: self.filesize,
            filesize_approx: self.filesize_approx.map(|n| n as u64),
            has_video,
            has_audio,
        }
    }
}

fn parse_info(json: &[u8]) -> Result<MediaInfo, TaskError> {
    let raw: RawInfo = serde_json::from_slice(json)
        .map_err(|e| TaskError::Transfer(format!("unreadable yt-dlp metadata: {e}")))?;

    if raw.kind.as_deref().is_some_and(|k| k != "video") {
        return Err(TaskError::InvalidRequest(
            "playlists and channels are not supported".into(),
        ));
    }

    let formats = raw
        .formats
        .into_iter()
        .filter(|f| f.ext != "mhtml")
        .map(RawFormat::into_format)
        .collect();

    Ok(MediaInfo {
        title: raw.title.unwrap_or_else(|| raw.id.clone()),
        id: raw.id,
        duration: raw
            .duration
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(Duration::from_secs_f64),
        is_live: raw.is_live.unwrap_or(false),
        formats,
    })
}
