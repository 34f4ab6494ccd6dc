mod config;
mod context;
mod error;
mod events;
mod postprocess;
mod progress;
mod request;
mod scheduler;
pub mod source;
mod store;
mod task;
mod worker;
pub mod prelude {
    pub use crate::{
        config::{QueueConfig, QueueConfigBuilder},
        error::{classify, ErrorKind, StoreError, TaskError},
        events::TaskEvent,
        postprocess::{Ffmpeg, Passthrough, PostprocessAction, PostprocessOptions, Postprocessor},
        progress::{estimate_percent, Progress},
        request::{RequestBuilder, TaskRequest},
        source::{Extractor, HttpExtractor, MediaFormat, MediaInfo, Transfer, YtDlpExtractor},
        store::TaskStore,
        task::{OutputFormat, Quality, Task, TaskFailure, TaskId, TaskResult, TaskStatus},
        CancelOutcome, DownloadQueue, DownloadQueueBuilder, QueueStatus,
    };
}

use crate::{
    context::Context,
    request::Request,
    scheduler::{Scheduler, SchedulerCmd},
};
use futures_core::Stream;
use prelude::*;
use serde::Serialize;
use std::sync::{atomic::Ordering, Arc};
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TrySendError},
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

/// What [DownloadQueue::cancel] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was still waiting and is now `cancelled`.
    Cancelled,
    /// The task is running; its worker will stop at the next check.
    Requested { status: TaskStatus },
    /// Nothing to do, the task had already finished.
    AlreadyFinished(TaskStatus),
}

/// Counts per state plus every task snapshot, in submission order.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub tasks: Vec<Task>,
}

impl QueueStatus {
    fn from_tasks(tasks: Vec<Task>) -> Self {
        let count = |pred: fn(TaskStatus) -> bool| {
            tasks.iter().filter(|t| pred(t.status())).count()
        };
        QueueStatus {
            active: count(TaskStatus::is_running),
            queued: count(|s| s == TaskStatus::Queued),
            completed: count(|s| s == TaskStatus::Completed),
            failed: count(|s| s == TaskStatus::Failed),
            cancelled: count(|s| s == TaskStatus::Cancelled),
            tasks,
        }
    }
}

/// Entry point for submitting, observing, and cancelling download tasks.
///
/// Behavior
/// - `submit` only validates and enqueues; all download work happens on
///   background workers, at most `max_concurrent` at a time.
/// - Task state lives in a [TaskStore]; poll it with [DownloadQueue::get_status].
/// - Lifecycle events are also broadcast; see [DownloadQueue::events].
///
/// Notes
/// - Events are delivered over a broadcast channel with a bounded buffer;
///   slow consumers can miss events.
/// - Use shutdown() for a graceful stop: it cancels all work and waits for workers to finish.
pub struct DownloadQueue {
    scheduler_tx: mpsc::Sender<SchedulerCmd>,
    ctx: Arc<Context>,
    tracker: TaskTracker,
}

impl Default for DownloadQueue {
    fn default() -> Self {
        DownloadQueue::builder()
            .build()
            .expect("default queue configuration is valid")
    }
}

impl DownloadQueue {
    /// Create a new builder for DownloadQueue.
    ///
    /// Without further settings it uses [QueueConfig::default], `yt-dlp` for
    /// extraction and `ffmpeg` for post-processing.
    pub fn builder() -> DownloadQueueBuilder {
        DownloadQueueBuilder::new()
    }

    /// Queue a download and return its id without waiting for any work.
    ///
    /// Fails with [ErrorKind::InvalidRequest] for unusable URLs and with
    /// [ErrorKind::CapacityExceeded] when the waiting line is full; no task is
    /// created in either case.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId, TaskError> {
        let url = request.parse_url()?;
        if !self.ctx.extractor.supports(&url) {
            return Err(TaskError::InvalidRequest(format!(
                "{} cannot handle {url}",
                self.ctx.extractor.name()
            )));
        }
        if self.ctx.cancel_root.is_cancelled() || self.scheduler_tx.is_closed() {
            return Err(TaskError::ManagerShutdown);
        }
        self.ctx.reserve_backlog_slot()?;

        let raw_url = request.url.trim().to_string();
        let cancel_token = self.ctx.child_token();
        // The token is in place before the task becomes visible to `cancel`.
        let id = loop {
            let id = self.ctx.next_id();
            if !self.ctx.register_token(id, cancel_token.clone()) {
                continue;
            }
            let task = Task::new(
                id,
                raw_url.clone(),
                request.format,
                request.quality,
                request.audio_only,
            );
            if self.ctx.store.put(task) {
                break id;
            }
            self.ctx.forget_token(id);
        };

        info!(
            id,
            url = %raw_url,
            format = ?request.format,
            quality = ?request.quality,
            "task queued"
        );
        self.ctx.emit(TaskEvent::Queued {
            id,
            url: raw_url,
        });

        let job = Request {
            id,
            url,
            spec: request,
            cancel_token,
        };
        if let Err(error) = self.scheduler_tx.try_send(SchedulerCmd::Enqueue { request: job }) {
            self.ctx.store.remove(id);
            self.ctx.forget_token(id);
            self.ctx.release_backlog_slot();
            return Err(match error {
                TrySendError::Closed(_) => TaskError::ManagerShutdown,
                TrySendError::Full(_) => TaskError::CapacityExceeded {
                    limit: self.ctx.config.max_queue_size(),
                },
            });
        }
        Ok(id)
    }

    /// Create a [RequestBuilder] to describe a download step by step.
    pub fn download_builder(&self) -> RequestBuilder<'_> {
        RequestBuilder::new(self)
    }

    /// Latest committed snapshot of a task.
    pub fn get_status(&self, id: TaskId) -> Result<Task, TaskError> {
        self.ctx.store.get(id).ok_or(TaskError::NotFound(id))
    }

    /// Cancel a task.
    ///
    /// - Waiting tasks are marked `cancelled` right away and never start.
    /// - Running tasks are signalled; the worker cleans up and writes `cancelled`.
    /// - Finished tasks are left alone and their status is reported.
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome, TaskError> {
        let written = self.ctx.store.update(id, |task| match task.status() {
            TaskStatus::Queued => task.cancel().map(|()| CancelOutcome::Cancelled),
            status => Ok(CancelOutcome::Requested { status }),
        });
        let outcome = match written {
            Ok(outcome) => outcome?,
            Err(StoreError::Finished { status, .. }) => {
                return Ok(CancelOutcome::AlreadyFinished(status));
            }
            Err(error) => return Err(error.into()),
        };

        if let Some(token) = self.ctx.token(id) {
            token.cancel();
        }
        match outcome {
            CancelOutcome::Cancelled => {
                self.ctx.forget_token(id);
                let _ = self.scheduler_tx.try_send(SchedulerCmd::Cancel { id });
                info!(id, "cancelled waiting task");
                self.ctx.emit(TaskEvent::Cancelled { id });
            }
            CancelOutcome::Requested { status } => info!(id, %status, "cancellation requested"),
            CancelOutcome::AlreadyFinished(_) => {}
        }
        Ok(outcome)
    }

    /// Every task, in submission order.
    pub fn list(&self) -> Vec<Task> {
        self.ctx.store.list()
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus::from_tasks(self.ctx.store.list())
    }

    /// Drop every completed, failed or cancelled task. Returns how many went.
    pub fn clear_completed(&self) -> usize {
        let removed = self.ctx.store.retain(|task| !task.is_terminal());
        for task in &removed {
            self.ctx.forget_token(task.id());
        }
        info!(count = removed.len(), "cleared finished tasks");
        removed.len()
    }

    /// Forget one finished task. Running or waiting tasks must be cancelled first.
    pub fn remove(&self, id: TaskId) -> Result<Task, TaskError> {
        let task = self.get_status(id)?;
        if !task.is_terminal() {
            return Err(TaskError::WrongState {
                id,
                status: task.status(),
            });
        }
        self.ctx.forget_token(id);
        self.ctx.store.remove(id).ok_or(TaskError::NotFound(id))
    }

    /// Open the delivered file of a completed task for reading.
    pub async fn open_result(&self, id: TaskId) -> Result<tokio::fs::File, TaskError> {
        let task = self.get_status(id)?;
        let result = task.result().ok_or(TaskError::WrongState {
            id,
            status: task.status(),
        })?;
        Ok(tokio::fs::File::open(&result.path).await?)
    }

    /// Number of tasks currently held by a worker.
    ///
    /// Does not include waiting tasks. Reflects active semaphore permits.
    pub fn active_downloads(&self) -> usize {
        self.ctx.active.load(Ordering::Acquire)
    }

    pub fn store(&self) -> Arc<TaskStore> {
        self.ctx.store.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.ctx.config
    }

    /// Cancel every unfinished task and keep accepting new submissions.
    ///
    /// Waiting tasks become `cancelled` right away; running workers are
    /// signalled and remove their partial files. Returns how many tasks were
    /// cancelled or signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for task in self.ctx.store.list() {
            if task.is_terminal() {
                continue;
            }
            match self.cancel(task.id()) {
                Ok(CancelOutcome::Cancelled | CancelOutcome::Requested { .. }) => count += 1,
                Ok(CancelOutcome::AlreadyFinished(_)) | Err(_) => {}
            }
        }
        info!(count, "cancelled all unfinished tasks");
        count
    }

    /// Return a child [CancellationToken] tied to the queue's root token.
    pub fn child_token(&self) -> CancellationToken {
        self.ctx.child_token()
    }

    /// Subscribe to all [TaskEvent] notifications.
    ///
    /// The underlying broadcast channel has a bounded buffer (1024). Slow
    /// consumers may lag and miss events. Consider using
    /// [DownloadQueue::events()] for a stream that skips lagged messages.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.ctx.events.subscribe()
    }

    /// A fallible-safe stream of [TaskEvent] values.
    ///
    /// Internally wraps the broadcast receiver and filters out lagged/closed errors.
    pub fn events(&self) -> impl Stream<Item = TaskEvent> + 'static {
        use tokio_stream::StreamExt as _;

        BroadcastStream::new(self.subscribe()).filter_map(|res| res.ok())
    }

    /// Gracefully stop the queue.
    ///
    /// - Cancels all in-flight work and stops the scheduler; later submissions
    ///   fail with [TaskError::ManagerShutdown].
    /// - Marks waiting tasks `cancelled` and waits for all worker tasks to finish.
    ///
    /// Call this before dropping the queue if you need deterministic teardown.
    pub async fn shutdown(&self) {
        info!("shutting down download queue");
        self.ctx.stop();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Builder for DownloadQueue.
///
/// Notes
/// - [DownloadQueueBuilder::build()] spawns the internal scheduler onto the current Tokio runtime.
pub struct DownloadQueueBuilder {
    config: Option<QueueConfig>,
    max_concurrent: Option<usize>,
    store: Option<Arc<TaskStore>>,
    extractor: Option<Arc<dyn Extractor>>,
    postprocessor: Option<Arc<dyn Postprocessor>>,
}

impl Default for DownloadQueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadQueueBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            max_concurrent: None,
            store: None,
            extractor: None,
            postprocessor: None,
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the configured worker limit. Must be greater than zero.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Share an existing store instead of creating an empty one.
    pub fn store(mut self, store: Arc<TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn extractor(mut self, extractor: impl Extractor + 'static) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    pub fn postprocessor(mut self, postprocessor: impl Postprocessor + 'static) -> Self {
        self.postprocessor = Some(Arc::new(postprocessor));
        self
    }

    /// Build and start the [DownloadQueue].
    ///
    /// Spawns the scheduler task and returns a ready-to-use queue.
    /// Fails if the worker limit is zero.
    pub fn build(self) -> anyhow::Result<DownloadQueue> {
        let mut config = self.config.unwrap_or_default();
        if let Some(max) = self.max_concurrent {
            config.set_max_concurrent(max);
        }
        if config.max_concurrent() == 0 {
            anyhow::bail!("Max concurrent downloads must be greater than 0");
        }

        let store = self.store.unwrap_or_default();
        let extractor = self
            .extractor
            .unwrap_or_else(|| Arc::new(YtDlpExtractor::default()) as Arc<dyn Extractor>);
        let postprocessor = self
            .postprocessor
            .unwrap_or_else(|| Arc::new(Ffmpeg::default()) as Arc<dyn Postprocessor>);

        info!(
            max_concurrent = config.max_concurrent(),
            max_queue_size = config.max_queue_size(),
            extractor = extractor.name(),
            "starting download queue"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(config.max_queue_size() + 1024);
        let ctx = Context::new(config, store, extractor, postprocessor);
        let tracker = TaskTracker::new();
        let scheduler = Scheduler::new(ctx.clone(), tracker.clone(), cmd_rx);

        let queue = DownloadQueue {
            scheduler_tx: cmd_tx,
            ctx: ctx.clone(),
            tracker: tracker.clone(),
        };

        tracker.spawn(async move { scheduler.run().await });

        Ok(queue)
    }
}
