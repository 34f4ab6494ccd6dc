//! Extraction collaborators: resolve a source URL into media metadata and a
//! byte stream for one concrete format.

mod http;
mod ytdlp;

pub use http::HttpExtractor;
pub use ytdlp::YtDlpExtractor;

use crate::{Quality, TaskError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::Url;
use std::{fmt, time::Duration};

/// Container of merged video+audio downloads. Matroska can be written as a
/// stream and holds any codec pair.
pub const MERGED_CONTAINER: &str = "mkv";

#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub duration: Option<Duration>,
    pub is_live: bool,
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    pub format_id: String,
    /// Container extension, e.g. `mp4` or `m4a`.
    pub ext: String,
    pub height: Option<u32>,
    /// Total bitrate in kbit/s.
    pub bitrate: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
}

impl MediaFormat {
    /// Separate video and audio streams fetched together and merged into one
    /// [MERGED_CONTAINER] file. The id joins both ids with `+`.
    pub fn merged(video: &MediaFormat, audio: &MediaFormat) -> Self {
        let sizes = |f: &MediaFormat| f.size_hint();
        MediaFormat {
            format_id: format!("{}+{}", video.format_id, audio.format_id),
            ext: MERGED_CONTAINER.to_string(),
            height: video.height,
            bitrate: match (video.bitrate, audio.bitrate) {
                (Some(v), Some(a)) => Some(v + a),
                (v, a) => v.or(a),
            },
            filesize: video.filesize.zip(audio.filesize).map(|(v, a)| v + a),
            filesize_approx: sizes(video).zip(sizes(audio)).map(|(v, a)| v + a),
            has_video: true,
            has_audio: true,
        }
    }

    pub fn is_merged(&self) -> bool {
        self.format_id.contains('+')
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }

    fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }
}

/// An open transfer of one format.
pub struct Transfer {
    pub total_bytes: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, TaskError>>,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this extractor can handle the URL at all. Checked at submit
    /// time, before a task is created.
    fn supports(&self, url: &Url) -> bool {
        let _ = url;
        true
    }

    async fn fetch_metadata(&self, url: &Url) -> Result<MediaInfo, TaskError>;

    fn select_format(
        &self,
        info: &MediaInfo,
        quality: Quality,
        audio_only: bool,
        container: &str,
    ) -> Result<MediaFormat, TaskError> {
        select_format(info, quality, audio_only, container)
    }

    /// Start transferring `format`. Dropping the returned stream must release
    /// every resource held by the transfer.
    async fn open(&self, url: &Url, format: &MediaFormat) -> Result<Transfer, TaskError>;
}

/// Pick the format matching the requested tier.
///
/// Audio requests prefer audio-only streams, highest bitrate first. Video
/// requests take the tallest frame within the tier's cap, then the requested
/// container, then bitrate. When the tallest frame only exists as a
/// video-only stream it is paired with the best audio stream (see
/// [MediaFormat::merged]). When nothing fits the cap the smallest available
/// frame is used; `worst` always takes the smallest.
pub fn select_format(
    info: &MediaInfo,
    quality: Quality,
    audio_only: bool,
    container: &str,
) -> Result<MediaFormat, TaskError> {
    if info.formats.is_empty() {
        return Err(TaskError::SourceUnavailable(format!(
            "no downloadable formats for '{}'",
            info.title
        )));
    }

    if audio_only {
        return best_audio(&info.formats, container)
            .or_else(|| {
                let muxed = info.formats.iter().filter(|f| f.has_audio);
                muxed.max_by_key(|f| (bitrate(f), f.ext == container))
            })
            .cloned()
            .ok_or_else(|| TaskError::SourceUnavailable("no audio stream available".into()));
    }

    let videos: Vec<&MediaFormat> = info.formats.iter().filter(|f| f.has_video).collect();
    let Some(smallest) = videos.iter().map(|f| height(f)).min() else {
        return Err(TaskError::SourceUnavailable("no video stream available".into()));
    };
    let cap = match quality {
        Quality::Worst => smallest,
        capped => capped.max_height().unwrap_or(u32::MAX).max(smallest),
    };

    let rank = |f: &&MediaFormat| (height(f), f.ext == container, bitrate(f));
    let fits = || videos.iter().copied().filter(|f| height(f) <= cap);
    let muxed = fits().filter(|f| f.has_audio).max_by_key(rank);
    let video_only = fits().filter(|f| !f.has_audio).max_by_key(rank);

    let chosen = match (muxed, video_only) {
        (Some(muxed), Some(video)) if height(video) <= height(muxed) => muxed.clone(),
        (Some(muxed), None) => muxed.clone(),
        (_, Some(video)) => match best_audio(&info.formats, container) {
            Some(audio) => MediaFormat::merged(video, audio),
            None => muxed.unwrap_or(video).clone(),
        },
        (None, None) => {
            return Err(TaskError::SourceUnavailable("no matching format".into()));
        }
    };
    Ok(chosen)
}

fn best_audio<'a>(formats: &'a [MediaFormat], container: &str) -> Option<&'a MediaFormat> {
    formats
        .iter()
        .filter(|f| f.is_audio_only())
        .max_by_key(|f| (bitrate(f), f.ext == container))
}

fn height(f: &MediaFormat) -> u32 {
    f.height.unwrap_or(0)
}

fn bitrate(f: &MediaFormat) -> u64 {
    (f.bitrate.unwrap_or(0.0) * 1000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(id: &str, ext: &str, height: u32, tbr: f64) -> MediaFormat {
        MediaFormat {
            format_id: id.into(),
            ext: ext.into(),
            height: Some(height),
            bitrate: Some(tbr),
            filesize: None,
            filesize_approx: None,
            has_video: true,
            has_audio: true,
        }
    }

    fn audio(id: &str, ext: &str, abr: f64) -> MediaFormat {
        MediaFormat {
            format_id: id.into(),
            ext: ext.into(),
            height: None,
            bitrate: Some(abr),
            filesize: None,
            filesize_approx: None,
            has_video: false,
            has_audio: true,
        }
    }

    fn info(formats: Vec<MediaFormat>) -> MediaInfo {
        MediaInfo {
            id: "abc".into(),
            title: "Clip".into(),
            duration: None,
            is_live: false,
            formats,
        }
    }

    fn sample() -> MediaInfo {
        info(vec![
            video("18", "mp4", 360, 500.0),
            video("22", "mp4", 720, 1500.0),
            video("43", "webm", 720, 1400.0),
            video("37", "mp4", 1080, 3000.0),
            audio("140", "m4a", 128.0),
            audio("251", "webm", 160.0),
        ])
    }

    #[test]
    fn best_picks_tallest_frame() {
        let f = select_format(&sample(), Quality::Best, false, "mp4").unwrap();
        assert_eq!(f.format_id, "37");
    }

    #[test]
    fn capped_quality_prefers_requested_container() {
        let f = select_format(&sample(), Quality::P720, false, "webm").unwrap();
        assert_eq!(f.format_id, "43");
        let f = select_format(&sample(), Quality::P720, false, "mp4").unwrap();
        assert_eq!(f.format_id, "22");
    }

    #[test]
    fn worst_picks_smallest_frame() {
        let f = select_format(&sample(), Quality::Worst, false, "mp4").unwrap();
        assert_eq!(f.format_id, "18");
    }

    #[test]
    fn cap_below_every_format_falls_back_to_smallest() {
        let formats = info(vec![video("22", "mp4", 720, 1500.0), video("37", "mp4", 1080, 3000.0)]);
        let f = select_format(&formats, Quality::P360, false, "mp4").unwrap();
        assert_eq!(f.format_id, "22");
    }

    fn video_only(id: &str, height: u32, tbr: f64, size: u64) -> MediaFormat {
        MediaFormat {
            filesize: Some(size),
            has_audio: false,
            ..video(id, "mp4", height, tbr)
        }
    }

    /// Only the lowest tier is muxed; taller frames come without audio.
    fn split_streams() -> MediaInfo {
        let mut audio = audio("140", "m4a", 129.0);
        audio.filesize = Some(3_000_000);
        info(vec![
            video("18", "mp4", 360, 500.0),
            video_only("136", 720, 1500.0, 20_000_000),
            video_only("137", 1080, 4400.0, 60_000_000),
            audio,
        ])
    }

    #[test]
    fn tall_video_only_stream_is_paired_with_audio() {
        let f = select_format(&split_streams(), Quality::Best, false, "mp4").unwrap();
        assert_eq!(f.format_id, "137+140");
        assert_eq!(f.ext, MERGED_CONTAINER);
        assert_eq!(f.height, Some(1080));
        assert!(f.is_merged() && f.has_audio && f.has_video);
        assert_eq!(f.size_hint(), Some(63_000_000));

        let f = select_format(&split_streams(), Quality::P1080, false, "mp4").unwrap();
        assert_eq!(f.format_id, "137+140");
        let f = select_format(&split_streams(), Quality::P720, false, "mp4").unwrap();
        assert_eq!(f.format_id, "136+140");
    }

    #[test]
    fn muxed_stream_wins_at_equal_height() {
        let f = select_format(&split_streams(), Quality::P480, false, "mp4").unwrap();
        assert_eq!(f.format_id, "18");
        assert!(!f.is_merged());
        let f = select_format(&split_streams(), Quality::Worst, false, "mp4").unwrap();
        assert_eq!(f.format_id, "18");
    }

    #[test]
    fn video_only_stream_without_audio_is_taken_alone() {
        let formats = info(vec![video_only("137", 1080, 4400.0, 1)]);
        let f = select_format(&formats, Quality::Best, false, "mp4").unwrap();
        assert_eq!(f.format_id, "137");
    }

    #[test]
    fn audio_only_prefers_highest_bitrate_audio_stream() {
        let f = select_format(&sample(), Quality::Best, true, "mp3").unwrap();
        assert_eq!(f.format_id, "251");
    }

    #[test]
    fn audio_only_falls_back_to_muxed_stream() {
        let formats = info(vec![video("18", "mp4", 360, 500.0)]);
        let f = select_format(&formats, Quality::Best, true, "mp3").unwrap();
        assert_eq!(f.format_id, "18");
    }

    #[test]
    fn empty_format_list_is_unavailable() {
        let err = select_format(&info(vec![]), Quality::Best, false, "mp4").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SourceUnavailable);
    }
}
