//! Asynchronous execution and resume runtime.
//!
//! Wires the worker pool, the liveness monitor and the state router together
//! and owns their shutdown order.

pub mod monitor;
pub mod pool;
pub mod registry;
pub mod reminder;
pub mod router;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use monitor::LivenessMonitor;
pub use pool::{Submission, TaskSubmitter, WorkerPool};
pub use registry::{ConversationRegistry, WaitRegistry};
pub use reminder::Reminders;
pub use router::{RouterHandle, RouterSettings, RouterStats, StateRouter};

use crate::auth::CredentialStore;
use crate::config::RuntimeConfig;
use crate::handlers::HandlerRegistry;
use crate::state::StateEvent;

const QUERY_CAPACITY: usize = 64;

/// The running background tasks plus the handles used to feed them.
pub struct Runtime {
    submitter: TaskSubmitter,
    state_tx: mpsc::Sender<StateEvent>,
    router: RouterHandle,
    reminders: Arc<Reminders>,
    workers: WorkerPool,
    monitor: LivenessMonitor,
    router_task: JoinHandle<()>,
    worker_shutdown: CancellationToken,
    router_shutdown: CancellationToken,
}

impl Runtime {
    /// Spawn workers, monitor and router. Must be called inside a tokio runtime.
    pub fn start(
        config: &RuntimeConfig,
        registry: Arc<HandlerRegistry>,
        store: Arc<CredentialStore>,
        reminders: Arc<Reminders>,
    ) -> Self {
        let (submitter, inbound) = pool::inbound_queue(config.inbound_capacity);
        let (state_tx, state_rx) = mpsc::channel(config.state_capacity);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let (router, queries) = router::query_channel(QUERY_CAPACITY);

        let worker_shutdown = CancellationToken::new();
        let router_shutdown = CancellationToken::new();

        let workers = WorkerPool::spawn(
            config.workers,
            pool::WorkerSettings {
                invocation_timeout: config.invocation_timeout,
                heartbeat_interval: config.heartbeat_interval,
            },
            inbound,
            state_tx.clone(),
            watch_tx,
            worker_shutdown.clone(),
        );

        let monitor = LivenessMonitor::spawn(
            watch_rx,
            submitter.clone(),
            config.max_retries,
            config.heartbeat_interval,
            worker_shutdown.clone(),
        );

        let router_task = StateRouter::new(
            registry,
            store,
            submitter.clone(),
            reminders.clone(),
            RouterSettings {
                wait_ttl: config.wait_ttl,
                conversation_ttl: config.conversation_ttl,
                sweep_interval: config.sweep_interval,
                exchange_timeout: config.exchange_timeout,
            },
        )
        .spawn(state_rx, queries, router_shutdown.clone());

        tracing::info!(
            workers = config.workers,
            timeout = ?config.invocation_timeout,
            max_retries = config.max_retries,
            "Runtime started"
        );

        Self {
            submitter,
            state_tx,
            router,
            reminders,
            workers,
            monitor,
            router_task,
            worker_shutdown,
            router_shutdown,
        }
    }

    pub fn submitter(&self) -> TaskSubmitter {
        self.submitter.clone()
    }

    /// Sender for the state queue, used by the callback receiver.
    pub fn state_sender(&self) -> mpsc::Sender<StateEvent> {
        self.state_tx.clone()
    }

    pub fn router(&self) -> RouterHandle {
        self.router.clone()
    }

    pub fn reminders(&self) -> Arc<Reminders> {
        self.reminders.clone()
    }

    /// Liveness monitor heartbeat count.
    pub fn heartbeats(&self) -> u64 {
        self.monitor.heartbeats()
    }

    /// Stop everything in order: workers, monitor, router, reminders.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down runtime");
        self.worker_shutdown.cancel();
        self.workers.join().await;
        // Workers held the only watch senders, so the monitor drains and exits.
        self.monitor.join().await;

        self.router_shutdown.cancel();
        if let Err(e) = self.router_task.await {
            tracing::error!(error = %e, "State router exited abnormally");
        }
        self.reminders.stop_all().await;
        tracing::info!("Runtime stopped");
    }
}
