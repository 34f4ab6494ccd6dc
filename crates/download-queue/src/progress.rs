use crate::{TaskEvent, TaskId, TaskStore};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::broadcast;
use tracing::trace;

const EMA_ALPHA: f64 = 0.3;

/// Highest percentage reported before a transfer has actually finished.
pub const ESTIMATE_CEILING: f64 = 99.0;

/// Bytes after which the unknown-size estimator reaches ~63% of its ceiling.
pub const ESTIMATE_SCALE_BYTES: f64 = 64.0 * 1024.0 * 1024.0;

/// Completion estimate for a transfer of unknown size.
///
/// Monotonic in `bytes` and always below [ESTIMATE_CEILING].
pub fn estimate_percent(bytes: u64) -> f64 {
    ESTIMATE_CEILING * (1.0 - (-(bytes as f64) / ESTIMATE_SCALE_BYTES).exp())
}

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub instantaneous_bps: f64,
    pub ema_bps: f64,

    started_at: Instant,
    updated_at: Instant,
    window_bytes: u64,
    finished: bool,
}

impl Progress {
    pub fn new(total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Progress {
            bytes_downloaded: 0,
            total_bytes,
            instantaneous_bps: 0.0,
            ema_bps: 0.0,
            started_at: now,
            updated_at: now,
            window_bytes: 0,
            finished: false,
        }
    }

    /// Account for `n` freshly received bytes. Returns `true` when at least
    /// `min_interval` has passed since the last sample, i.e. an update is due.
    pub fn update(&mut self, n: u64, min_interval: Duration) -> bool {
        self.bytes_downloaded += n;
        self.window_bytes += n;
        let now = Instant::now();
        if now.duration_since(self.updated_at) < min_interval {
            return false;
        }
        self.sample(now);
        true
    }

    /// Close the current sampling window regardless of the interval and mark
    /// the transfer as finished.
    pub fn force_update(&mut self) {
        self.sample(Instant::now());
        self.finished = true;
    }

    fn sample(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.updated_at).as_secs_f64();
        if elapsed > 0.0 {
            self.instantaneous_bps = self.window_bytes as f64 / elapsed;
            self.ema_bps = if self.ema_bps == 0.0 {
                self.instantaneous_bps
            } else {
                EMA_ALPHA * self.instantaneous_bps + (1.0 - EMA_ALPHA) * self.ema_bps
            };
        }
        self.window_bytes = 0;
        self.updated_at = now;
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Completion percentage; below 100 until [Progress::force_update].
    pub fn percent(&self) -> f64 {
        if self.finished {
            return 100.0;
        }
        match self.total_bytes {
            Some(total) if total > 0 => {
                (self.bytes_downloaded as f64 / total as f64 * 100.0).min(ESTIMATE_CEILING)
            }
            _ => estimate_percent(self.bytes_downloaded),
        }
    }

    pub fn speed(&self) -> Option<f64> {
        (self.ema_bps > 0.0).then_some(self.ema_bps)
    }

    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_bytes?;
        if self.ema_bps <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes_downloaded);
        Some(Duration::from_secs_f64(remaining as f64 / self.ema_bps))
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Pushes throttled progress samples of one task into the [TaskStore].
///
/// Writes are synchronous so a snapshot taken right after a commit reflects
/// it. A `Progress` event is broadcast after each commit.
pub struct ProgressReporter {
    id: TaskId,
    store: Arc<TaskStore>,
    events: broadcast::Sender<TaskEvent>,
    progress: Progress,
    min_interval: Duration,
}

impl ProgressReporter {
    pub fn new(
        id: TaskId,
        store: Arc<TaskStore>,
        events: broadcast::Sender<TaskEvent>,
        total_bytes: Option<u64>,
        min_interval: Duration,
    ) -> Self {
        Self {
            id,
            store,
            events,
            progress: Progress::new(total_bytes),
            min_interval,
        }
    }

    pub fn advance(&mut self, n: u64) {
        if self.progress.update(n, self.min_interval) {
            self.commit();
        }
    }

    pub fn finish(&mut self) {
        self.progress.force_update();
        self.commit();
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    fn commit(&self) {
        let percent = self.progress.percent();
        let bytes = self.progress.bytes_downloaded();
        let speed = self.progress.speed();
        let eta = self.progress.eta().map(|d| d.as_secs());

        let applied = self
            .store
            .update(self.id, |task| task.record_progress(percent, bytes, speed, eta))
            .unwrap_or(false);
        if !applied {
            return;
        }

        trace!(id = self.id, bytes, percent, "progress");
        let _ = self.events.send(TaskEvent::Progress {
            id: self.id,
            percent,
            bytes_downloaded: bytes,
            total_bytes: self.progress.total_bytes,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutputFormat, Quality, Task, TaskStatus};

    #[test]
    fn estimator_is_monotonic_and_bounded() {
        let mut last = -1.0;
        for mib in 0..4096u64 {
            let pct = estimate_percent(mib * 1024 * 1024);
            assert!(pct >= last, "estimate regressed at {mib} MiB");
            assert!(pct < 100.0);
            last = pct;
        }
        assert_eq!(estimate_percent(0), 0.0);
        assert!(estimate_percent(u64::MAX) <= ESTIMATE_CEILING);
    }

    #[test]
    fn known_total_stays_below_100_until_finished() {
        let mut p = Progress::new(Some(1000));
        p.update(500, Duration::ZERO);
        assert_eq!(p.percent(), 50.0);
        p.update(600, Duration::ZERO);
        assert_eq!(p.percent(), ESTIMATE_CEILING);
        p.force_update();
        assert_eq!(p.percent(), 100.0);
        assert!(p.is_finished());
    }

    #[test]
    fn updates_are_throttled() {
        let mut p = Progress::new(None);
        assert!(!p.update(10, Duration::from_secs(3600)));
        assert!(!p.update(10, Duration::from_secs(3600)));
        assert_eq!(p.bytes_downloaded(), 20);
        assert!(p.update(10, Duration::ZERO));
    }

    #[test]
    fn eta_requires_total_and_rate() {
        let mut p = Progress::new(None);
        p.update(100, Duration::ZERO);
        assert!(p.eta().is_none());

        let p = Progress::new(Some(100));
        assert!(p.eta().is_none());
    }

    fn store_with_downloading_task() -> Arc<TaskStore> {
        let store = Arc::new(TaskStore::new());
        store.put(Task::new(1, "https://example.com/v", OutputFormat::Mp4, Quality::Best, false));
        store
            .update(1, |t| {
                t.transition(TaskStatus::FetchingInfo)?;
                t.transition(TaskStatus::Downloading)
            })
            .unwrap()
            .unwrap();
        store
    }

    #[test]
    fn reporter_commits_into_store() {
        let store = store_with_downloading_task();
        let (events, mut rx) = broadcast::channel(16);
        let mut reporter =
            ProgressReporter::new(1, store.clone(), events, Some(400), Duration::ZERO);

        reporter.advance(100);
        let snapshot = store.get(1).unwrap();
        assert_eq!(snapshot.downloaded_bytes(), 100);
        assert_eq!(snapshot.progress(), 25.0);
        assert!(matches!(
            rx.try_recv(),
            Ok(TaskEvent::Progress { id: 1, bytes_downloaded: 100, .. })
        ));

        reporter.advance(300);
        reporter.finish();
        let snapshot = store.get(1).unwrap();
        assert_eq!(snapshot.downloaded_bytes(), 400);
        assert_eq!(snapshot.progress(), 100.0);
    }

    #[test]
    fn throttled_reporter_skips_store_writes() {
        let store = store_with_downloading_task();
        let (events, _rx) = broadcast::channel(16);
        let mut reporter =
            ProgressReporter::new(1, store.clone(), events, None, Duration::from_secs(3600));

        for _ in 0..100 {
            reporter.advance(1024);
        }
        assert_eq!(store.get(1).unwrap().downloaded_bytes(), 0);
        reporter.finish();
        assert_eq!(store.get(1).unwrap().downloaded_bytes(), 100 * 1024);
    }
}
