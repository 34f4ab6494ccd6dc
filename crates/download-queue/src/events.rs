use crate::{ErrorKind, TaskId, TaskStatus};
use std::{fmt, path::PathBuf};

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Queued {
        id: TaskId,
        url: String,
    },
    StatusChanged {
        id: TaskId,
        status: TaskStatus,
    },
    Progress {
        id: TaskId,
        percent: f64,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    Completed {
        id: TaskId,
        path: PathBuf,
        size: u64,
    },
    Failed {
        id: TaskId,
        kind: ErrorKind,
        error: String,
    },
    Cancelled {
        id: TaskId,
    },
    /// A finished task was dropped by the retention sweep.
    Evicted {
        id: TaskId,
        status: TaskStatus,
    },
}

impl TaskEvent {
    pub fn id(&self) -> TaskId {
        match self {
            TaskEvent::Queued { id, .. }
            | TaskEvent::StatusChanged { id, .. }
            | TaskEvent::Progress { id, .. }
            | TaskEvent::Completed { id, .. }
            | TaskEvent::Failed { id, .. }
            | TaskEvent::Cancelled { id }
            | TaskEvent::Evicted { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Completed { .. } | TaskEvent::Failed { .. } | TaskEvent::Cancelled { .. }
        )
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEvent::Queued { id, url } => write!(f, "#{id} queued ({url})"),
            TaskEvent::StatusChanged { id, status } => write!(f, "#{id} {status}"),
            TaskEvent::Progress {
                id,
                percent,
                bytes_downloaded,
                total_bytes,
            } => match total_bytes {
                Some(total) => write!(f, "#{id} {percent:.1}% ({bytes_downloaded}/{total} bytes)"),
                None => write!(f, "#{id} ~{percent:.1}% ({bytes_downloaded} bytes)"),
            },
            TaskEvent::Completed { id, path, size } => {
                write!(f, "#{id} completed: {} ({size} bytes)", path.display())
            }
            TaskEvent::Failed { id, kind, error } => write!(f, "#{id} failed [{kind}]: {error}"),
            TaskEvent::Cancelled { id } => write!(f, "#{id} cancelled"),
            TaskEvent::Evicted { id, status } => write!(f, "#{id} evicted ({status})"),
        }
    }
}
