//! Liveness monitor: retries invocations that overrun their deadline.
//!
//! Entries arrive in dispatch order and share one bound, so deadlines are
//! non-decreasing and the monitor can supervise them one at a time.
//! Retrying a stalled invocation does not cancel it; a handler that wakes up
//! late still runs to completion, so side effects may happen more than once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pool::{TaskSubmitter, Watch};

/// Handle to the running monitor.
pub struct LivenessMonitor {
    task: JoinHandle<()>,
    heartbeats: Arc<AtomicU64>,
}

impl LivenessMonitor {
    /// Start supervising entries from `watches`.
    ///
    /// The monitor exits once every sender of `watches` is gone and the
    /// channel is drained. After `shutdown` fires, overdue entries are
    /// logged instead of retried.
    pub(crate) fn spawn(
        watches: mpsc::UnboundedReceiver<Watch>,
        submitter: TaskSubmitter,
        max_retries: u32,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let heartbeats = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(monitor_loop(
            watches,
            submitter,
            max_retries,
            heartbeat_interval,
            heartbeats.clone(),
            shutdown,
        ));
        Self { task, heartbeats }
    }

    /// Number of idle polls so far. Keeps growing while the monitor is alive.
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Liveness monitor exited abnormally");
        }
    }
}

async fn monitor_loop(
    mut watches: mpsc::UnboundedReceiver<Watch>,
    submitter: TaskSubmitter,
    max_retries: u32,
    heartbeat_interval: Duration,
    heartbeats: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    tracing::info!(max_retries, "Liveness monitor started");
    loop {
        match tokio::time::timeout(heartbeat_interval, watches.recv()).await {
            Err(_) => {
                heartbeats.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => break,
            Ok(Some(watch)) => supervise(watch, &submitter, max_retries, &shutdown).await,
        }
    }
    tracing::info!("Liveness monitor stopped");
}

async fn supervise(
    watch: Watch,
    submitter: &TaskSubmitter,
    max_retries: u32,
    shutdown: &CancellationToken,
) {
    let Watch {
        mut handle,
        submission,
        deadline,
    } = watch;
    let intent = submission.task.intent().to_string();

    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!(intent = %intent, attempt = submission.attempt, "Handler panicked");
        }
        Ok(Err(e)) => {
            tracing::warn!(intent = %intent, error = %e, "Invocation was cancelled");
        }
        Err(_) => {
            if shutdown.is_cancelled() {
                tracing::warn!(intent = %intent, "Invocation overran during shutdown; not retried");
                return;
            }
            if submission.attempt >= max_retries {
                tracing::error!(
                    intent = %intent,
                    attempts = submission.attempt + 1,
                    "Invocation keeps timing out; giving up"
                );
                return;
            }
            let attempt = submission.attempt + 1;
            match submitter.resubmit(submission.task, attempt) {
                Ok(()) => {
                    tracing::warn!(intent = %intent, attempt, "Invocation timed out; retrying");
                }
                Err(e) => {
                    tracing::error!(intent = %intent, error = %e, "Retry could not be enqueued");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::auth::IdentityKey;
    use crate::channels::output_channel;
    use crate::error::HandlerError;
    use crate::handlers::{HandlerRegistry, IntentHandler};
    use crate::runtime::pool::{Submission, inbound_queue};
    use crate::state::Outcome;
    use crate::task::{CredentialContext, Entities, EventSnapshot, Task};

    struct Noop;

    #[async_trait]
    impl IntentHandler for Noop {
        fn intent(&self) -> &str {
            "noop"
        }

        fn example(&self) -> &str {
            "noop"
        }

        async fn handle(&self, _task: &Task) -> Result<Outcome, HandlerError> {
            Ok(Outcome::Done)
        }
    }

    fn task() -> Task {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Noop));
        let (out, _rx) = output_channel(1);
        registry
            .task(
                "noop",
                EventSnapshot::new("U1", "C1", "hi"),
                Entities::new(),
                CredentialContext::new(IdentityKey::new("hal")),
                out,
            )
            .unwrap()
    }

    fn stalled(attempt: u32) -> Watch {
        Watch {
            handle: tokio::spawn(std::future::pending::<()>()),
            submission: Submission {
                task: task(),
                attempt,
            },
            deadline: Instant::now() + Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn overdue_invocation_is_resubmitted_unchanged() {
        let (submitter, mut inbound) = inbound_queue(4);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let monitor = LivenessMonitor::spawn(
            watch_rx,
            submitter,
            3,
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        let original = stalled(0);
        let expected = original.submission.task.clone();
        watch_tx.send(original).unwrap();

        let retried = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.task, expected);

        drop(watch_tx);
        tokio::time::timeout(Duration::from_secs(2), monitor.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_limit_is_respected() {
        let (submitter, mut inbound) = inbound_queue(4);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let monitor = LivenessMonitor::spawn(
            watch_rx,
            submitter,
            2,
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        watch_tx.send(stalled(2)).unwrap();
        drop(watch_tx);
        tokio::time::timeout(Duration::from_secs(2), monitor.join())
            .await
            .unwrap();
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_retry_during_shutdown() {
        let (submitter, mut inbound) = inbound_queue(4);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let monitor =
            LivenessMonitor::spawn(watch_rx, submitter, 3, Duration::from_millis(10), shutdown);
        watch_tx.send(stalled(0)).unwrap();
        drop(watch_tx);
        tokio::time::timeout(Duration::from_secs(2), monitor.join())
            .await
            .unwrap();
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn completed_invocation_is_not_retried_and_heartbeat_advances() {
        let (submitter, mut inbound) = inbound_queue(4);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let monitor = LivenessMonitor::spawn(
            watch_rx,
            submitter,
            3,
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        watch_tx
            .send(Watch {
                handle: tokio::spawn(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                submission: Submission {
                    task: task(),
                    attempt: 0,
                },
                deadline: Instant::now() + Duration::from_secs(1),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.heartbeats() > 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(inbound.try_recv().is_err());

        drop(watch_tx);
        monitor.join().await;
    }
}
