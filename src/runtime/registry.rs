//! In-memory registries of suspended tasks and open conversations.
//!
//! Both are owned by the state router and never shared, so they are plain
//! maps without locking.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::state::{ConversationKind, ConversationState, OnboardingContext, WaitState};

/// Suspended tasks keyed by suspension token.
#[derive(Debug, Default)]
pub struct WaitRegistry {
    waits: HashMap<Uuid, WaitState>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, wait: WaitState) {
        tracing::debug!(token = %wait.token, intent = %wait.intent, "Wait registered");
        if self.waits.insert(wait.token, wait).is_some() {
            tracing::warn!("Suspension token reused; previous wait replaced");
        }
    }

    pub fn get(&self, token: &Uuid) -> Option<&WaitState> {
        self.waits.get(token)
    }

    pub fn remove(&mut self, token: &Uuid) -> Option<WaitState> {
        self.waits.remove(token)
    }

    /// Drop waits older than `ttl`, returning them.
    pub fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<WaitState> {
        let expired: Vec<Uuid> = self
            .waits
            .values()
            .filter(|w| w.is_expired(now, ttl))
            .map(|w| w.token)
            .collect();
        expired
            .iter()
            .filter_map(|token| self.waits.remove(token))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}

/// What happened to a conversation passed to [`ConversationRegistry::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Inserted,
    Updated,
    /// The conversation was done and is gone from the registry.
    Removed(ConversationState),
}

/// Open multi-turn conversations keyed by id.
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    conversations: HashMap<Uuid, ConversationState>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert or remove `conversation` depending on whether it is done.
    ///
    /// Handlers work on snapshots, so two turns of the same conversation can
    /// race. An update is merged into the stored state instead of replacing
    /// it: intents consumed by either side stay consumed and context fields
    /// filled in by either side are kept.
    pub fn apply(&mut self, incoming: ConversationState) -> Applied {
        let existed = self.conversations.contains_key(&incoming.id);
        let mut conversation = match self.conversations.remove(&incoming.id) {
            Some(stored) => merge(stored, incoming),
            None => incoming,
        };

        if conversation.is_done() {
            tracing::info!(conversation = %conversation.id, kind = conversation.kind.name(), "Conversation finished");
            return Applied::Removed(conversation);
        }
        conversation.updated_at = Utc::now();
        self.conversations.insert(conversation.id, conversation);
        if existed {
            Applied::Updated
        } else {
            Applied::Inserted
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&ConversationState> {
        self.conversations.get(id)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<ConversationState> {
        self.conversations.remove(id)
    }

    /// Every conversation awaiting `intent`.
    pub fn candidates(&self, intent: &str) -> Vec<&ConversationState> {
        self.conversations
            .values()
            .filter(|c| c.is_awaiting(intent))
            .collect()
    }

    /// The conversation `intent` belongs to. With several candidates the most
    /// recently updated wins, then the larger id.
    pub fn find(&self, intent: &str) -> Option<&ConversationState> {
        let candidates = self.candidates(intent);
        if candidates.len() > 1 {
            tracing::debug!(intent, candidates = candidates.len(), "Ambiguous conversation match");
        }
        candidates
            .into_iter()
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
    }

    /// Drop conversations idle for longer than `ttl`, returning them.
    pub fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<ConversationState> {
        let expired: Vec<Uuid> = self
            .conversations
            .values()
            .filter(|c| {
                now.signed_duration_since(c.updated_at)
                    .to_std()
                    .is_ok_and(|idle| idle > ttl)
            })
            .map(|c| c.id)
            .collect();
        expired
            .iter()
            .filter_map(|id| self.conversations.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

/// Combine a handler's view of a conversation with the registered one.
fn merge(stored: ConversationState, incoming: ConversationState) -> ConversationState {
    let waiting_for = stored
        .waiting_for
        .intersection(&incoming.waiting_for)
        .cloned()
        .collect();
    let kind = match (stored.kind, incoming.kind) {
        (ConversationKind::Onboarding(old), ConversationKind::Onboarding(new)) => {
            ConversationKind::Onboarding(OnboardingContext {
                account_info: new.account_info.or(old.account_info),
                phone_number: new.phone_number.or(old.phone_number),
                email: new.email.or(old.email),
                start_date: new.start_date.or(old.start_date),
                ..new
            })
        }
        (_, kind) => kind,
    };
    ConversationState {
        id: incoming.id,
        waiting_for,
        kind,
        finished: stored.finished || incoming.finished,
        updated_at: incoming.updated_at,
    }
}
