use anyhow::anyhow;
use derive_builder::Builder;
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 50;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_FETCH_RETRIES: u32 = 2;
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Builder, Clone)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct QueueConfig {
    /// Workers allowed to run at the same time.
    #[builder(default = "DEFAULT_MAX_CONCURRENT")]
    max_concurrent: usize,
    /// Tasks allowed to wait for a worker before `submit` starts rejecting.
    #[builder(default = "DEFAULT_MAX_QUEUE_SIZE")]
    max_queue_size: usize,
    #[builder(default = "PathBuf::from(\"downloads\")", setter(into))]
    download_dir: PathBuf,
    #[builder(default = "PathBuf::from(\"temp\")", setter(into))]
    temp_dir: PathBuf,
    /// Minimum spacing between two progress writes of one task.
    #[builder(default = "DEFAULT_PROGRESS_INTERVAL")]
    progress_interval: Duration,
    /// Extra metadata attempts after a transfer error.
    #[builder(default = "DEFAULT_FETCH_RETRIES")]
    fetch_retries: u32,
    #[builder(default = "Some(DEFAULT_MAX_DURATION)")]
    max_duration: Option<Duration>,
    #[builder(default)]
    max_file_size: Option<u64>,
    #[builder(default)]
    task_timeout: Option<Duration>,
    /// How long finished tasks are kept before the retention sweep drops them.
    #[builder(default)]
    retention: Option<Duration>,
}

impl QueueConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == Some(0) {
            return Err("max_concurrent must be greater than 0".into());
        }
        if self.max_queue_size == Some(0) {
            return Err("max_queue_size must be greater than 0".into());
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            download_dir: PathBuf::from("downloads"),
            temp_dir: PathBuf::from("temp"),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            max_duration: Some(DEFAULT_MAX_DURATION),
            max_file_size: None,
            task_timeout: None,
            retention: None,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from a key lookup; missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut builder = QueueConfig::builder();

        if let Some(n) = parse(&lookup, "MAX_CONCURRENT_DOWNLOADS")? {
            builder = builder.max_concurrent(n);
        }
        if let Some(n) = parse(&lookup, "MAX_QUEUE_SIZE")? {
            builder = builder.max_queue_size(n);
        }
        if let Some(dir) = lookup("DOWNLOAD_DIR").filter(|v| !v.is_empty()) {
            builder = builder.download_dir(dir);
        }
        if let Some(dir) = lookup("TEMP_DIR").filter(|v| !v.is_empty()) {
            builder = builder.temp_dir(dir);
        }
        if let Some(ms) = parse(&lookup, "PROGRESS_INTERVAL_MS")? {
            builder = builder.progress_interval(Duration::from_millis(ms));
        }
        if let Some(n) = parse(&lookup, "FETCH_RETRIES")? {
            builder = builder.fetch_retries(n);
        }
        if let Some(secs) = parse::<u64>(&lookup, "MAX_VIDEO_DURATION")? {
            builder = builder.max_duration((secs > 0).then(|| Duration::from_secs(secs)));
        }
        if let Some(mb) = parse::<u64>(&lookup, "MAX_FILE_SIZE_MB")? {
            builder = builder.max_file_size((mb > 0).then(|| mb * 1024 * 1024));
        }
        if let Some(secs) = parse::<u64>(&lookup, "TASK_TIMEOUT_SECS")? {
            builder = builder.task_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        if let Some(secs) = parse::<u64>(&lookup, "RETENTION_SECS")? {
            builder = builder.retention((secs > 0).then(|| Duration::from_secs(secs)));
        }

        Ok(builder.build()?)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub(crate) fn set_max_concurrent(&mut self, max: usize) {
        self.max_concurrent = max;
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn download_dir(&self) -> &PathBuf {
        &self.download_dir
    }

    pub fn temp_dir(&self) -> &PathBuf {
        &self.temp_dir
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    pub fn fetch_retries(&self) -> u32 {
        self.fetch_retries
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid value for {key} ({raw:?}): {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_builder_defaults() {
        let built = QueueConfig::builder().build().unwrap();
        let default = QueueConfig::default();
        assert_eq!(built.max_concurrent(), default.max_concurrent());
        assert_eq!(built.max_queue_size(), 50);
        assert_eq!(built.download_dir(), &PathBuf::from("downloads"));
        assert_eq!(built.progress_interval(), Duration::from_millis(100));
        assert_eq!(built.max_duration(), Some(Duration::from_secs(7200)));
        assert_eq!(built.task_timeout(), None);
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(QueueConfig::builder().max_concurrent(0).build().is_err());
        assert!(QueueConfig::builder().max_queue_size(0).build().is_err());
    }

    #[test]
    fn reads_overrides_from_lookup() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("MAX_CONCURRENT_DOWNLOADS", "5"),
            ("MAX_QUEUE_SIZE", " 10 "),
            ("DOWNLOAD_DIR", "/srv/media"),
            ("MAX_FILE_SIZE_MB", "2"),
            ("MAX_VIDEO_DURATION", "0"),
            ("TASK_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent(), 5);
        assert_eq!(config.max_queue_size(), 10);
        assert_eq!(config.download_dir(), &PathBuf::from("/srv/media"));
        assert_eq!(config.temp_dir(), &PathBuf::from("temp"));
        assert_eq!(config.max_file_size(), Some(2 * 1024 * 1024));
        assert_eq!(config.max_duration(), None);
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = QueueConfig::from_lookup(lookup(&[("MAX_QUEUE_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("MAX_QUEUE_SIZE"));

        assert!(QueueConfig::from_lookup(lookup(&[("MAX_CONCURRENT_DOWNLOADS", "0")])).is_err());
    }
}
