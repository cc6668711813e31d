//! Frozen context of a task suspended pending external authorization.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::channels::OutputHandle;
use crate::task::{CredentialContext, Entities, EventSnapshot, Task};

/// A suspended task, keyed by its one-time suspension token.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitState {
    pub token: Uuid,
    pub intent: String,
    pub event: EventSnapshot,
    pub entities: Entities,
    pub credentials: CredentialContext,
    pub output: OutputHandle,
    pub created_at: DateTime<Utc>,
}

impl WaitState {
    /// Freeze `task` under `token`.
    pub fn from_task(task: &Task, token: Uuid) -> Self {
        Self {
            token,
            intent: task.intent().to_string(),
            event: task.event().clone(),
            entities: task.entities().clone(),
            credentials: task.credentials().clone(),
            output: task.output().clone(),
            created_at: Utc::now(),
        }
    }

    /// Whether the wait is older than `ttl` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        now.signed_duration_since(self.created_at)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }
}
