//! Task — one queued handler invocation with its input snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{Credential, IdentityKey};
use crate::channels::{OutputHandle, direct_channel};
use crate::handlers::IntentHandler;
use crate::state::ConversationState;

/// Confidence floor applied when picking the best entity candidate.
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.75;

/// One candidate value for an extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub value: String,
    pub confidence: f64,
}

impl Entity {
    pub fn new(value: impl Into<String>, confidence: f64) -> Self {
        Self {
            value: value.into(),
            confidence,
        }
    }
}

/// Entities extracted from a message by the classifier, keyed by entity name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entities(HashMap<String, Vec<Entity>>);

impl Entities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of one candidate.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>, confidence: f64) -> Self {
        self.push(name, Entity::new(value, confidence));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, entity: Entity) {
        self.0.entry(name.into()).or_default().push(entity);
    }

    /// All candidates for `name`, in extraction order.
    pub fn all(&self, name: &str) -> &[Entity] {
        self.0.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Highest-confidence candidate above the default floor.
    pub fn best(&self, name: &str) -> Option<&Entity> {
        self.best_above(name, DEFAULT_CONFIDENCE_FLOOR)
    }

    /// Highest-confidence candidate strictly above `floor`. The first one
    /// wins on equal confidence.
    pub fn best_above(&self, name: &str, floor: f64) -> Option<&Entity> {
        let best = self
            .all(name)
            .iter()
            .filter(|e| e.confidence > floor)
            .fold(None::<&Entity>, |best, e| match best {
                Some(b) if b.confidence >= e.confidence => Some(b),
                _ => Some(e),
            });
        if best.is_none() {
            tracing::debug!(entity = name, floor, "No candidate met the confidence floor");
        }
        best
    }

    /// Convenience: value of the best candidate.
    pub fn best_value(&self, name: &str) -> Option<&str> {
        self.best(name).map(|e| e.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Snapshot of the chat event that triggered a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub user_id: String,
    pub user_name: String,
    pub channel_id: String,
    pub channel_name: String,
    /// Private channel with the user, used for authorization prompts.
    pub dm_channel: String,
    /// Message text with the bot mention already stripped.
    pub text: String,
    pub received_at: DateTime<Utc>,
    /// Conversation matched for this event, if any.
    pub conversation: Option<ConversationState>,
}

impl EventSnapshot {
    pub fn new(
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        let channel_id = channel_id.into();
        Self {
            user_name: user_id.clone(),
            channel_name: channel_id.clone(),
            dm_channel: direct_channel(&user_id),
            user_id,
            channel_id,
            text: text.into(),
            received_at: Utc::now(),
            conversation: None,
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = name.into();
        self
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn with_dm_channel(mut self, channel: impl Into<String>) -> Self {
        self.dm_channel = channel.into();
        self
    }

    pub fn with_conversation(mut self, conversation: Option<ConversationState>) -> Self {
        self.conversation = conversation;
        self
    }

    /// Whether the event arrived on the user's private channel.
    pub fn is_direct(&self) -> bool {
        self.channel_id == self.dm_channel
    }
}

/// Which identity a task resolves credentials for, and what it resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialContext {
    pub identity: IdentityKey,
    pub credential: Option<Credential>,
}

impl CredentialContext {
    pub fn new(identity: IdentityKey) -> Self {
        Self {
            identity,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }
}

/// An immutable unit of work: a handler plus the inputs it runs against.
///
/// Only [`crate::handlers::HandlerRegistry::task`] constructs tasks, so a task
/// always refers to a registered handler.
#[derive(Clone)]
pub struct Task {
    handler: Arc<dyn IntentHandler>,
    event: EventSnapshot,
    entities: Entities,
    credentials: CredentialContext,
    output: OutputHandle,
}

impl Task {
    pub(crate) fn new(
        handler: Arc<dyn IntentHandler>,
        event: EventSnapshot,
        entities: Entities,
        credentials: CredentialContext,
        output: OutputHandle,
    ) -> Self {
        Self {
            handler,
            event,
            entities,
            credentials,
            output,
        }
    }

    pub fn intent(&self) -> &str {
        self.handler.intent()
    }

    pub fn handler(&self) -> &Arc<dyn IntentHandler> {
        &self.handler
    }

    pub fn event(&self) -> &EventSnapshot {
        &self.event
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    pub fn credentials(&self) -> &CredentialContext {
        &self.credentials
    }

    pub fn output(&self) -> &OutputHandle {
        &self.output
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.intent() == other.intent()
            && self.event == other.event
            && self.entities == other.entities
            && self.credentials == other.credentials
            && self.output == other.output
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("intent", &self.intent())
            .field("user", &self.event.user_id)
            .field("channel", &self.event.channel_id)
            .field("identity", &self.credentials.identity)
            .field("has_credential", &self.credentials.credential.is_some())
            .finish()
    }
}
