//! Cancelable periodic reminders.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channels::OutputHandle;

/// Periodic reminder tasks keyed by id.
///
/// A reminder sends the same text every interval until stopped. Stop requests
/// are honored between sends, never in the middle of one.
pub struct Reminders {
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Reminders {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a reminder and return its id.
    pub async fn start(
        &self,
        interval: Duration,
        output: OutputHandle,
        channel: impl Into<String>,
        text: impl Into<String>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let token = self.shutdown.child_token();
        self.active.lock().await.insert(id, token.clone());
        spawn_reminder(id, interval, output, channel.into(), text.into(), token);
        tracing::info!(reminder = %id, ?interval, "Reminder started");
        id
    }

    /// Stop one reminder. Returns false if it was not running.
    pub async fn stop(&self, id: Uuid) -> bool {
        match self.active.lock().await.remove(&id) {
            Some(token) => {
                token.cancel();
                tracing::info!(reminder = %id, "Reminder stopped");
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        let stopped = self.active.lock().await.drain().count();
        tracing::info!(stopped, "All reminders stopped");
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.active.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.active.lock().await.len()
    }
}

impl Default for Reminders {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_reminder(
    id: Uuid,
    interval: Duration,
    output: OutputHandle,
    channel: String,
    text: String,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = output.send(&channel, &text).await {
                tracing::warn!(reminder = %id, error = %e, "Reminder delivery failed");
                break;
            }
        }
        tracing::debug!(reminder = %id, "Reminder loop exited");
    })
}
