use std::{
    collections::{HashMap, VecDeque},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use chrono::Utc;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit},
    time::{Interval, MissedTickBehavior},
};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{context::Context, request::Request, worker, TaskEvent, TaskId, TaskStatus};

const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60);
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

pub(crate) enum SchedulerCmd {
    Enqueue { request: Request },
    Cancel { id: TaskId },
}

pub(crate) enum WorkerMsg {
    Finished { id: TaskId },
}

/// Single owner of the waiting line. Tasks leave it in submission order,
/// one per free permit.
pub(crate) struct Scheduler {
    ctx: Arc<Context>,
    tracker: TaskTracker,

    cmd_rx: mpsc::Receiver<SchedulerCmd>,
    worker_tx: mpsc::Sender<WorkerMsg>,
    worker_rx: mpsc::Receiver<WorkerMsg>,
    accepting: bool,

    jobs: HashMap<TaskId, Request>,
    ready: VecDeque<TaskId>,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<Context>,
        tracker: TaskTracker,
        cmd_rx: mpsc::Receiver<SchedulerCmd>,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(1024);
        Self {
            ctx,
            tracker,
            cmd_rx,
            worker_tx,
            worker_rx,
            accepting: true,
            jobs: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub async fn run(mut self) {
        let mut sweep = self.ctx.config.retention().map(|retention| {
            let period = (retention / 2).clamp(MIN_SWEEP_PERIOD, MAX_SWEEP_PERIOD);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            self.try_dispatch();
            if !self.accepting
                && self.ready.is_empty()
                && self.ctx.active.load(Ordering::Acquire) == 0
            {
                break;
            }

            tokio::select! {
                biased;
                _ = self.ctx.cancel_root.cancelled() => break,
                cmd = self.cmd_rx.recv(), if self.accepting => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => self.accepting = false,
                },
                Some(msg) = self.worker_rx.recv() => self.handle_worker_msg(msg),
                _ = tick(&mut sweep) => self.sweep_expired().await,
            }
        }

        self.drain();
        debug!("scheduler stopped");
    }

    fn handle_cmd(&mut self, cmd: SchedulerCmd) {
        match cmd {
            SchedulerCmd::Enqueue { request } => {
                let id = request.id;
                debug!(id, waiting = self.ready.len() + 1, "task enqueued");
                self.jobs.insert(id, request);
                self.ready.push_back(id);
            }
            SchedulerCmd::Cancel { id } => {
                if self.jobs.remove(&id).is_some() {
                    self.ready.retain(|&waiting| waiting != id);
                    self.ctx.release_backlog_slot();
                    debug!(id, "dropped cancelled task from the waiting line");
                }
            }
        }
    }

    fn handle_worker_msg(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Finished { id } => {
                debug!(id, active = self.ctx.active.load(Ordering::Relaxed), "worker finished");
            }
        }
    }

    fn try_dispatch(&mut self) {
        struct ActiveGuard {
            ctx: Arc<Context>,
            _permit: OwnedSemaphorePermit,
        }

        impl ActiveGuard {
            fn new(ctx: Arc<Context>, permit: OwnedSemaphorePermit) -> Self {
                ctx.active.fetch_add(1, Ordering::AcqRel);
                Self { ctx, _permit: permit }
            }
        }

        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                self.ctx.active.fetch_sub(1, Ordering::AcqRel);
            }
        }

        while let Some(&id) = self.ready.front() {
            let Ok(permit) = self.ctx.semaphore.clone().try_acquire_owned() else {
                // Every worker slot is taken; the next Finished message wakes us.
                return;
            };
            self.ready.pop_front();

            let Some(request) = self.jobs.remove(&id) else {
                continue;
            };
            self.ctx.release_backlog_slot();

            match self.ctx.store.get(id).map(|task| task.status()) {
                Some(TaskStatus::Queued) => {}
                status => {
                    debug!(id, ?status, "skipping task that is no longer queued");
                    continue;
                }
            }

            debug!(id, url = %request.url, "dispatching task");
            let guard = ActiveGuard::new(self.ctx.clone(), permit);
            let ctx = self.ctx.clone();
            let worker_tx = self.worker_tx.clone();

            self.tracker.spawn(async move {
                worker::run(&ctx, request).await;
                // The terminal state is written; free the slot before reporting.
                drop(guard);
                let _ = worker_tx.send(WorkerMsg::Finished { id }).await;
            });
        }
    }

    async fn sweep_expired(&self) {
        let Some(retention) = self.ctx.config.retention() else {
            return;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;

        let evicted = self
            .ctx
            .store
            .retain(|task| !(task.is_terminal() && task.updated_at() < cutoff));
        for task in evicted {
            info!(id = task.id(), status = %task.status(), "evicting expired task");
            if let Some(result) = task.result() {
                if let Err(error) = tokio::fs::remove_file(&result.path).await {
                    warn!(
                        id = task.id(),
                        path = %result.path.display(),
                        %error,
                        "failed to delete expired download"
                    );
                }
            }
            self.ctx.forget_token(task.id());
            self.ctx.emit(TaskEvent::Evicted {
                id: task.id(),
                status: task.status(),
            });
        }
    }

    /// Cancel every task still waiting for a worker, including submissions
    /// whose command has not been received yet.
    fn drain(&mut self) {
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.handle_cmd(cmd);
        }

        for (id, _) in self.jobs.drain() {
            self.ctx.release_backlog_slot();
            self.ctx.forget_token(id);
            if let Ok(Ok(())) = self.ctx.store.update(id, |task| task.cancel()) {
                info!(id, "cancelled waiting task on shutdown");
                self.ctx.emit(TaskEvent::Cancelled { id });
            }
        }
        self.ready.clear();
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
