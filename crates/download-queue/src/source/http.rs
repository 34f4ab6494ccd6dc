use super::{Extractor, MediaFormat, MediaInfo, Transfer};
use crate::TaskError;
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{header, Client, Method, StatusCode, Url};
use tracing::debug;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "mov", "m4v", "avi", "flv", "ts"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "ogg", "opus", "flac", "wav"];

/// Extractor for URLs that point straight at a media file.
#[derive(Debug, Clone)]
pub struct HttpExtractor {
    client: Client,
}

impl Default for HttpExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpExtractor {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        HttpExtractor { client }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    fn name(&self) -> &str {
        "http"
    }

    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn fetch_metadata(&self, url: &Url) -> Result<MediaInfo, TaskError> {
        let resp = self.client.request(Method::HEAD, url.as_ref()).send().await?;
        check_status(resp.status())?;

        let content_length = resp.content_length().filter(|&n| n > 0);
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());
        debug!(%url, ?content_length, ?content_type, "probed direct media");

        if content_type.as_deref().is_some_and(|ct| ct.starts_with("text/html")) {
            return Err(TaskError::SourceUnavailable(format!(
                "{url} is a web page, not a media file"
            )));
        }

        let (stem, path_ext) = file_name_parts(url);
        let ext = path_ext
            .or_else(|| content_type.as_deref().and_then(extension_for_mime).map(str::to_string))
            .unwrap_or_else(|| "bin".to_string());
        let has_video = content_type
            .as_deref()
            .map(|ct| ct.starts_with("video/"))
            .unwrap_or_else(|| VIDEO_EXTENSIONS.contains(&ext.as_str()));
        let has_audio = has_video
            || AUDIO_EXTENSIONS.contains(&ext.as_str())
            || content_type.as_deref().is_some_and(|ct| ct.starts_with("audio/"));

        Ok(MediaInfo {
            id: stem.clone(),
            title: stem,
            duration: None,
            is_live: false,
            formats: vec![MediaFormat {
                format_id: "direct".to_string(),
                ext,
                height: None,
                bitrate: None,
                filesize: content_length,
                filesize_approx: None,
                has_video,
                has_audio,
            }],
        })
    }

    async fn open(&self, url: &Url, format: &MediaFormat) -> Result<Transfer, TaskError> {
        let resp = self.client.request(Method::GET, url.as_ref()).send().await?;
        check_status(resp.status())?;

        let total_bytes = resp.content_length().or(format.size_hint());
        let stream = resp.bytes_stream().map_err(TaskError::from).boxed();
        Ok(Transfer { total_bytes, stream })
    }
}

fn check_status(status: StatusCode) -> Result<(), TaskError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => Err(TaskError::SourceProtected(format!(
            "server answered {status}"
        ))),
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::GONE => {
            Err(TaskError::SourceUnavailable(format!("server answered {status}")))
        }
        _ => Err(TaskError::Transfer(format!("server answered {status}"))),
    }
}

fn file_name_parts(url: &Url) -> (String, Option<String>) {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("download");
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && ext.len() <= 5 => {
            (stem.to_string(), Some(ext.to_ascii_lowercase()))
        }
        _ => (name.to_string(), None),
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    Some(match essence {
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/x-matroska" => "mkv",
        "video/quicktime" => "mov",
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        "audio/ogg" => "ogg",
        "audio/webm" => "webm",
        "audio/flac" => "flac",
        _ => return None,
    })
}
