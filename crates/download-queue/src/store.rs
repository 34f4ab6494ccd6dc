use crate::{StoreError, Task, TaskId};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Concurrency-safe table of task records.
///
/// Every mutation goes through [TaskStore::update], which holds the write
/// lock for the duration of the mutator only. Locks are never held across an
/// `.await`, so readers polling [TaskStore::get] never wait on a worker's I/O.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new task. Returns `false` if the id is already taken.
    pub fn put(&self, task: Task) -> bool {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id()) {
            return false;
        }
        tasks.insert(task.id(), task);
        true
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().get(&id).cloned()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.read().contains_key(&id)
    }

    /// Atomic read-modify-write of one task.
    ///
    /// Tasks in a terminal state are rejected with [StoreError::Finished] and
    /// the mutator is not called.
    pub fn update<R>(
        &self,
        id: TaskId,
        mutator: impl FnOnce(&mut Task) -> R,
    ) -> Result<R, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.is_terminal() {
            return Err(StoreError::Finished {
                id,
                status: task.status(),
            });
        }
        Ok(mutator(task))
    }

    /// All tasks in submission order.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().cloned().collect();
        tasks.sort_by_key(Task::id);
        tasks
    }

    pub fn remove(&self, id: TaskId) -> Option<Task> {
        self.tasks.write().remove(&id)
    }

    /// Keep only the tasks matching `keep`; returns the removed ones.
    pub fn retain(&self, mut keep: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let mut tasks = self.tasks.write();
        let doomed: Vec<TaskId> = tasks
            .values()
            .filter(|task| !keep(task))
            .map(Task::id)
            .collect();
        let mut removed: Vec<Task> = doomed.iter().filter_map(|id| tasks.remove(id)).collect();
        removed.sort_by_key(Task::id);
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, OutputFormat, Quality, TaskStatus};
    use std::sync::Arc;

    fn task(id: TaskId) -> Task {
        Task::new(id, format!("https://example.com/{id}"), OutputFormat::Mp4, Quality::Best, false)
    }

    fn downloading(store: &TaskStore, id: TaskId) {
        store.put(task(id));
        store
            .update(id, |t| {
                t.transition(TaskStatus::FetchingInfo)?;
                t.transition(TaskStatus::Downloading)
            })
            .unwrap()
            .unwrap();
    }

    #[test]
    fn put_get_list_remove() {
        let store = TaskStore::new();
        assert!(store.put(task(2)));
        assert!(store.put(task(1)));
        assert!(!store.put(task(1)));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(1).unwrap().url(), "https://example.com/1");
        assert!(store.get(9).is_none());
        let ids: Vec<_> = store.list().iter().map(Task::id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.remove(1).map(|t| t.id()), Some(1));
        assert!(!store.contains(1));
    }

    #[test]
    fn update_unknown_task_is_not_found() {
        let store = TaskStore::new();
        assert_eq!(store.update(4, |_| ()), Err(StoreError::NotFound(4)));
    }

    #[test]
    fn terminal_tasks_reject_updates() {
        let store = TaskStore::new();
        store.put(task(1));
        store.update(1, |t| t.cancel()).unwrap().unwrap();

        let mut called = false;
        let res = store.update(1, |t| {
            called = true;
            t.fail(ErrorKind::Internal, "late")
        });
        assert!(!called);
        assert_eq!(
            res,
            Err(StoreError::Finished {
                id: 1,
                status: TaskStatus::Cancelled
            })
        );
        assert_eq!(store.get(1).unwrap().status(), TaskStatus::Cancelled);
    }

    #[test]
    fn concurrent_updates_to_one_task_are_serialized() {
        let store = Arc::new(TaskStore::new());
        downloading(&store, 1);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for _ in 0..500 {
                        store
                            .update(1, |t| {
                                let next = t.downloaded_bytes() + 1;
                                t.record_progress(0.0, next, None, None)
                            })
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(store.get(1).unwrap().downloaded_bytes(), 8 * 500);
    }

    #[test]
    fn concurrent_updates_to_different_tasks_are_not_lost() {
        let store = Arc::new(TaskStore::new());
        for id in 1..=8 {
            downloading(&store, id);
        }

        std::thread::scope(|scope| {
            for id in 1..=8u64 {
                let store = store.clone();
                scope.spawn(move || {
                    for step in 1..=200u64 {
                        let pct = step as f64 / 2.0;
                        store
                            .update(id, |t| t.record_progress(pct, step * id, None, None))
                            .unwrap();
                    }
                });
            }
        });

        for id in 1..=8 {
            let t = store.get(id).unwrap();
            assert_eq!(t.downloaded_bytes(), 200 * id);
            assert_eq!(t.progress(), 100.0);
        }
    }

    #[test]
    fn retain_returns_removed_tasks() {
        let store = TaskStore::new();
        for id in 1..=4 {
            store.put(task(id));
        }
        store.update(2, |t| t.cancel()).unwrap().unwrap();
        store.update(4, |t| t.cancel()).unwrap().unwrap();

        let removed = store.retain(|t| !t.is_terminal());
        let removed: Vec<_> = removed.iter().map(Task::id).collect();
        assert_eq!(removed, vec![2, 4]);
        assert_eq!(store.len(), 2);
    }
}
