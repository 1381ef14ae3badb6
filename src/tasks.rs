use anyhow::Result;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::Sender,
        Arc, Mutex,
    },
};
use thiserror::Error;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;

pub const QUEUE_CAPACITY: usize = 64;

pub type TaskId = u64;

type Job = Box<dyn FnOnce(&TaskContext) -> Result<String> + Send + 'static>;

#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent {
    Started {
        id: TaskId,
        label: String,
    },
    Progress {
        id: TaskId,
        done: u64,
        total: u64,
        message: Option<String>,
    },
    Finished {
        id: TaskId,
        label: String,
        summary: String,
    },
    Failed {
        id: TaskId,
        label: String,
        error: String,
    },
    Cancelled {
        id: TaskId,
        label: String,
    },
}

impl TaskEvent {
    pub fn id(&self) -> TaskId {
        match self {
            TaskEvent::Started { id, .. }
            | TaskEvent::Progress { id, .. }
            | TaskEvent::Finished { id, .. }
            | TaskEvent::Failed { id, .. }
            | TaskEvent::Cancelled { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Finished { .. } | TaskEvent::Failed { .. } | TaskEvent::Cancelled { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task queue is full ({QUEUE_CAPACITY} pending)")]
    QueueFull,
    #[error("task worker has stopped")]
    Closed,
}

pub struct TaskContext {
    id: TaskId,
    cancel: CancellationToken,
    events: Sender<TaskEvent>,
    handle: Handle,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress(&self, done: u64, total: u64, message: Option<String>) {
        let _ = self.events.send(TaskEvent::Progress {
            id: self.id,
            done,
            total,
            message,
        });
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

#[derive(Clone, Debug)]
pub struct TaskHandle {
    pub id: TaskId,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct LiveTask {
    label: String,
    cancel: CancellationToken,
}

struct QueuedTask {
    id: TaskId,
    label: String,
    cancel: CancellationToken,
    job: Job,
}

pub struct TaskQueue {
    sender: mpsc::Sender<QueuedTask>,
    live: Arc<Mutex<HashMap<TaskId, LiveTask>>>,
    next_id: AtomicU64,
}

impl TaskQueue {
    pub fn new(handle: Handle, events: Sender<TaskEvent>) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let live = Arc::new(Mutex::new(HashMap::new()));
        handle.spawn(run_worker(handle.clone(), receiver, events, live.clone()));
        Self {
            sender,
            live,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn submit<F>(&self, label: impl Into<String>, job: F) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce(&TaskContext) -> Result<String> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        let cancel = CancellationToken::new();
        self.live.lock().expect("task registry poisoned").insert(
            id,
            LiveTask {
                label: label.clone(),
                cancel: cancel.clone(),
            },
        );
        let task = QueuedTask {
            id,
            label,
            cancel: cancel.clone(),
            job: Box::new(job),
        };

        if let Err(err) = self.sender.try_send(task) {
            self.live.lock().expect("task registry poisoned").remove(&id);
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => TaskError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TaskError::Closed,
            });
        }
        debug!("Queued task {id}");
        Ok(TaskHandle { id, cancel })
    }

    /// Cancels queued or running jobs with the same label, then queues `job`.
    pub fn submit_exclusive<F>(&self, label: impl Into<String>, job: F) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce(&TaskContext) -> Result<String> + Send + 'static,
    {
        let label = label.into();
        for task in self.live.lock().expect("task registry poisoned").values() {
            if task.label == label {
                task.cancel.cancel();
            }
        }
        self.submit(label, job)
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        match self.live.lock().expect("task registry poisoned").get(&id) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for task in self.live.lock().expect("task registry poisoned").values() {
            task.cancel.cancel();
        }
    }

    pub fn pending(&self) -> usize {
        self.live.lock().expect("task registry poisoned").len()
    }
}

async fn run_worker(
    handle: Handle,
    mut receiver: mpsc::Receiver<QueuedTask>,
    events: Sender<TaskEvent>,
    live: Arc<Mutex<HashMap<TaskId, LiveTask>>>,
) {
    while let Some(task) = receiver.recv().await {
        let QueuedTask {
            id,
            label,
            cancel,
            job,
        } = task;

        let event = if cancel.is_cancelled() {
            TaskEvent::Cancelled { id, label }
        } else {
            let _ = events.send(TaskEvent::Started {
                id,
                label: label.clone(),
            });
            let context = TaskContext {
                id,
                cancel: cancel.clone(),
                events: events.clone(),
                handle: handle.clone(),
            };
            match tokio::task::spawn_blocking(move || job(&context)).await {
                Ok(_) if cancel.is_cancelled() => TaskEvent::Cancelled { id, label },
                Ok(Ok(summary)) => {
                    info!("{label}: {summary}");
                    TaskEvent::Finished { id, label, summary }
                }
                Ok(Err(err)) => {
                    warn!("{label} failed: {err:#}");
                    TaskEvent::Failed {
                        id,
                        label,
                        error: format!("{err:#}"),
                    }
                }
                Err(join_err) => {
                    warn!("{label} panicked: {join_err}");
                    TaskEvent::Failed {
                        id,
                        label,
                        error: join_err.to_string(),
                    }
                }
            }
        };

        live.lock().expect("task registry poisoned").remove(&id);
        let _ = events.send(event);
    }
    debug!("Task worker stopped");
}
