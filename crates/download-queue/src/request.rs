use crate::{DownloadQueue, OutputFormat, Quality, TaskError, TaskId};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// What a client asks for. Only `url` is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub url: String,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub audio_only: bool,
}

impl TaskRequest {
    pub fn new(url: impl Into<String>) -> Self {
        TaskRequest {
            url: url.into(),
            format: OutputFormat::default(),
            quality: Quality::default(),
            audio_only: false,
        }
    }

    /// Whether the delivered file is audio only.
    pub fn wants_audio(&self) -> bool {
        self.audio_only || self.format.is_audio()
    }

    /// Extension of the delivered file.
    pub fn target_ext(&self) -> &'static str {
        if self.wants_audio() {
            OutputFormat::Audio.extension()
        } else {
            self.format.extension()
        }
    }

    /// Quality actually used for format selection; `mobile` caps at 480p.
    pub fn effective_quality(&self) -> Quality {
        match (self.format, self.quality) {
            (_, Quality::Worst) => Quality::Worst,
            (OutputFormat::Mobile, q) if q.max_height().is_none_or(|h| h > 480) => Quality::P480,
            (_, q) => q,
        }
    }

    /// Parse and check the URL before any task is created.
    pub(crate) fn parse_url(&self) -> Result<Url, TaskError> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(TaskError::InvalidRequest("URL is required".into()));
        }
        let url = Url::parse(raw)
            .map_err(|e| TaskError::InvalidRequest(format!("'{raw}' is not a valid URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TaskError::InvalidRequest(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(TaskError::InvalidRequest(format!("'{raw}' has no host")));
        }
        Ok(url)
    }
}

/// A submitted task as seen by the scheduler and its worker.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub id: TaskId,
    pub url: Url,
    pub spec: TaskRequest,
    pub cancel_token: CancellationToken,
}

pub struct RequestBuilder<'a> {
    request: TaskRequest,
    queue: &'a DownloadQueue,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(queue: &'a DownloadQueue) -> Self {
        RequestBuilder {
            request: TaskRequest::new(""),
            queue,
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.request.url = url.into();
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.request.format = format;
        self
    }

    pub fn quality(mut self, quality: Quality) -> Self {
        self.request.quality = quality;
        self
    }

    pub fn audio_only(mut self, audio_only: bool) -> Self {
        self.request.audio_only = audio_only;
        self
    }

    pub fn submit(self) -> Result<TaskId, TaskError> {
        self.queue.submit(self.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_urls() {
        for raw in [
            "not-a-real-url",
            "",
            "   ",
            "ftp://example.com/a.mp4",
            "file:///etc/passwd",
            "http://",
        ] {
            let err = TaskRequest::new(raw).parse_url().unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidRequest, "{raw}");
        }
    }

    #[test]
    fn accepts_http_urls() {
        let url = TaskRequest::new(" https://www.youtube.com/watch?v=dQw4w9WgXcQ ")
            .parse_url()
            .unwrap();
        assert_eq!(url.host_str(), Some("www.youtube.com"));
    }

    #[test]
    fn audio_flag_or_format_selects_mp3() {
        let mut req = TaskRequest::new("https://example.com/v");
        assert_eq!(req.target_ext(), "mp4");
        req.audio_only = true;
        assert_eq!(req.target_ext(), "mp3");
        req.audio_only = false;
        req.format = OutputFormat::Audio;
        assert!(req.wants_audio());
    }

    #[test]
    fn mobile_caps_quality() {
        let mut req = TaskRequest::new("https://example.com/v");
        req.format = OutputFormat::Mobile;
        assert_eq!(req.effective_quality(), Quality::P480);
        req.quality = Quality::P360;
        assert_eq!(req.effective_quality(), Quality::P360);
        req.format = OutputFormat::Mp4;
        req.quality = Quality::P1080;
        assert_eq!(req.effective_quality(), Quality::P1080);
    }

    #[test]
    fn deserializes_with_defaults() {
        let req: TaskRequest =
            serde_json::from_str(r#"{"url": "https://example.com/v", "quality": "720p"}"#)
                .unwrap();
        assert_eq!(req.format, OutputFormat::Mp4);
        assert_eq!(req.quality, Quality::P720);
        assert!(!req.audio_only);
    }
}
