//! Bounded worker pool executing intent handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SubmitError;
use crate::state::{Outcome, StateEvent};
use crate::task::Task;

/// A task on the inbound queue, with how many times it has been retried.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task: Task,
    pub attempt: u32,
}

/// A dispatched invocation handed to the liveness monitor.
#[derive(Debug)]
pub struct Watch {
    pub handle: JoinHandle<()>,
    pub submission: Submission,
    pub deadline: Instant,
}

/// Cloneable handle for placing tasks on the inbound queue.
#[derive(Debug, Clone)]
pub struct TaskSubmitter {
    tx: mpsc::Sender<Submission>,
    capacity: usize,
}

impl TaskSubmitter {
    pub(crate) fn new(tx: mpsc::Sender<Submission>, capacity: usize) -> Self {
        Self { tx, capacity }
    }

    /// Enqueue without waiting. Fails when the queue is full or closed.
    pub fn submit(&self, task: Task) -> Result<(), SubmitError> {
        self.enqueue(Submission { task, attempt: 0 })
    }

    /// Enqueue, waiting for capacity.
    pub async fn submit_wait(&self, task: Task) -> Result<(), SubmitError> {
        self.tx
            .send(Submission { task, attempt: 0 })
            .await
            .map_err(|_| SubmitError::Closed)
    }

    /// Put a timed-out task back on the queue as-is.
    pub(crate) fn resubmit(&self, task: Task, attempt: u32) -> Result<(), SubmitError> {
        self.enqueue(Submission { task, attempt })
    }

    fn enqueue(&self, submission: Submission) -> Result<(), SubmitError> {
        self.tx.try_send(submission).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

/// Create the inbound queue.
pub(crate) fn inbound_queue(capacity: usize) -> (TaskSubmitter, mpsc::Receiver<Submission>) {
    let (tx, rx) = mpsc::channel(capacity);
    (TaskSubmitter::new(tx, capacity), rx)
}

/// Settings shared by every worker.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub invocation_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// The running workers.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        count: usize,
        settings: WorkerSettings,
        inbound: mpsc::Receiver<Submission>,
        state_tx: mpsc::Sender<StateEvent>,
        watch_tx: mpsc::UnboundedSender<Watch>,
        cancel: CancellationToken,
    ) -> Self {
        let inbound = Arc::new(Mutex::new(inbound));
        let workers = (0..count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    settings.clone(),
                    inbound.clone(),
                    state_tx.clone(),
                    watch_tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        tracing::info!(workers = count, "Worker pool started");
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit. Cancel them first.
    pub async fn join(self) {
        let results = futures::future::join_all(self.workers).await;
        for (id, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                tracing::error!(worker = id, error = %e, "Worker exited abnormally");
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    settings: WorkerSettings,
    inbound: Arc<Mutex<mpsc::Receiver<Submission>>>,
    state_tx: mpsc::Sender<StateEvent>,
    watch_tx: mpsc::UnboundedSender<Watch>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker = id, "Worker started");
    loop {
        let received = {
            let mut rx = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                rx = inbound.lock() => rx,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(settings.heartbeat_interval, rx.recv()) => r,
            }
        };

        let submission = match received {
            Ok(Some(submission)) => submission,
            Ok(None) => {
                tracing::debug!(worker = id, "Inbound queue closed");
                break;
            }
            Err(_) => continue,
        };

        let (done_tx, done_rx) = oneshot::channel();
        let task = submission.task.clone();
        let events = state_tx.clone();
        let handle = tokio::spawn(async move {
            invoke(task, events).await;
            let _ = done_tx.send(());
        });
        let deadline = Instant::now() + settings.invocation_timeout;

        tracing::debug!(
            worker = id,
            intent = submission.task.intent(),
            attempt = submission.attempt,
            "Dispatched task"
        );
        if watch_tx
            .send(Watch {
                handle,
                submission,
                deadline,
            })
            .is_err()
        {
            tracing::warn!(worker = id, "Liveness monitor is gone; invocation unsupervised");
        }

        // A stalled invocation keeps running detached; the monitor retries it.
        let _ = tokio::time::timeout_at(deadline, done_rx).await;
    }
    tracing::debug!(worker = id, "Worker stopped");
}

/// Run one handler and publish its outcome.
async fn invoke(task: Task, state_tx: mpsc::Sender<StateEvent>) {
    let intent = task.intent().to_string();
    match task.handler().handle(&task).await {
        Ok(Outcome::Done) => {
            tracing::debug!(intent = %intent, "Task completed");
        }
        Ok(outcome) => {
            tracing::debug!(intent = %intent, outcome = outcome.kind(), "Publishing state update");
            if state_tx.send(StateEvent::StateUpdate(outcome)).await.is_err() {
                tracing::warn!(intent = %intent, "State queue closed; outcome dropped");
            }
        }
        Err(e) => {
            tracing::error!(intent = %intent, error = %e, "Handler failed");
        }
    }
}
