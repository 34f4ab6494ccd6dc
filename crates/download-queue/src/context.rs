use crate::{Extractor, Postprocessor, QueueConfig, TaskError, TaskEvent, TaskId, TaskStore};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub(crate) struct Context {
    pub config: QueueConfig,
    pub store: Arc<TaskStore>,
    pub extractor: Arc<dyn Extractor>,
    pub postprocessor: Arc<dyn Postprocessor>,

    pub semaphore: Arc<Semaphore>,
    pub cancel_root: CancellationToken,
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,

    // Counters
    pub id_counter: AtomicU64,
    pub active: AtomicUsize,
    pub backlog: AtomicUsize,

    pub events: broadcast::Sender<TaskEvent>,
}

impl Context {
    pub fn new(
        config: QueueConfig,
        store: Arc<TaskStore>,
        extractor: Arc<dyn Extractor>,
        postprocessor: Arc<dyn Postprocessor>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent())),
            cancel_root: CancellationToken::new(),
            tokens: Mutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            backlog: AtomicUsize::new(0),
            config,
            store,
            extractor,
            postprocessor,
            events,
        })
    }

    #[inline]
    pub fn next_id(&self) -> TaskId {
        self.id_counter.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_root.child_token()
    }

    /// Cancel the root token. Every task token and the scheduler observe it.
    pub fn stop(&self) {
        self.cancel_root.cancel();
    }

    pub fn emit(&self, event: TaskEvent) {
        trace!(%event, "event");
        let _ = self.events.send(event);
    }

    /// Claim one waiting slot, failing when `max_queue_size` tasks already
    /// wait for a worker.
    pub fn reserve_backlog_slot(&self) -> Result<(), TaskError> {
        let limit = self.config.max_queue_size();
        self.backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| TaskError::CapacityExceeded { limit })
    }

    pub fn release_backlog_slot(&self) {
        let _ = self
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Attach `token` to `id`. Returns `false` and leaves the map alone when
    /// the id already has one.
    pub fn register_token(&self, id: TaskId, token: CancellationToken) -> bool {
        match self.tokens.lock().entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
        }
    }

    pub fn token(&self, id: TaskId) -> Option<CancellationToken> {
        self.tokens.lock().get(&id).cloned()
    }

    pub fn forget_token(&self, id: TaskId) {
        self.tokens.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Passthrough, YtDlpExtractor};

    fn context() -> Arc<Context> {
        Context::new(
            QueueConfig::default(),
            Arc::default(),
            Arc::new(YtDlpExtractor::default()),
            Arc::new(Passthrough),
        )
    }

    #[test]
    fn registered_token_is_never_replaced() {
        let ctx = context();
        let first = ctx.child_token();
        assert!(ctx.register_token(7, first.clone()));
        assert!(!ctx.register_token(7, ctx.child_token()));

        ctx.token(7).unwrap().cancel();
        assert!(first.is_cancelled());

        ctx.forget_token(7);
        assert!(ctx.token(7).is_none());
        assert!(ctx.register_token(7, ctx.child_token()));
    }

    #[test]
    fn backlog_slots_are_bounded() {
        let ctx = context();
        let limit = ctx.config.max_queue_size();
        for _ in 0..limit {
            ctx.reserve_backlog_slot().unwrap();
        }
        assert!(matches!(
            ctx.reserve_backlog_slot(),
            Err(TaskError::CapacityExceeded { .. })
        ));
        ctx.release_backlog_slot();
        ctx.reserve_backlog_slot().unwrap();
    }

    #[test]
    fn stop_cancels_task_tokens() {
        let ctx = context();
        let token = ctx.child_token();
        ctx.stop();
        assert!(token.is_cancelled());
        assert!(ctx.child_token().is_cancelled());
    }
}
