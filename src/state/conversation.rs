//! Multi-turn conversation state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HandlerError;

/// Intents an onboarding conversation waits for, in the order they are announced.
pub const ONBOARDING_STEPS: [&str; 5] = [
    "accounts-setup",
    "desk-setup",
    "phones-setup",
    "email-setup",
    "slack-setup",
];

/// Intent that answers a nag.
pub const NAG_RESPONSE: &str = "nag-response";

/// Where to report progress of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnTarget {
    pub user: String,
    pub channel: String,
}

/// Context accumulated while onboarding a new employee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingContext {
    pub return_to: ReturnTarget,
    pub new_employee: String,
    pub start_date: Option<String>,
    pub account_info: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

/// Context of an ongoing nag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaggingContext {
    pub return_to: ReturnTarget,
    pub dm_channel: String,
    pub user_to_nag: String,
    pub subject: String,
    /// Periodic reminder started for this nag.
    pub reminder_id: Uuid,
}

/// Typed context per conversation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationKind {
    Onboarding(OnboardingContext),
    Nagging(NaggingContext),
}

impl ConversationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Onboarding(_) => "onboarding",
            Self::Nagging(_) => "nagging",
        }
    }
}

/// Shared context and remaining expected intents for a multi-turn exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: Uuid,
    pub waiting_for: BTreeSet<String>,
    pub kind: ConversationKind,
    pub finished: bool,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new<I, S>(waiting_for: I, kind: ConversationKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            waiting_for: waiting_for.into_iter().map(Into::into).collect(),
            kind,
            finished: false,
            updated_at: Utc::now(),
        }
    }

    pub fn onboarding(context: OnboardingContext) -> Self {
        Self::new(ONBOARDING_STEPS, ConversationKind::Onboarding(context))
    }

    pub fn nagging(context: NaggingContext) -> Self {
        Self::new([NAG_RESPONSE], ConversationKind::Nagging(context))
    }

    pub fn is_awaiting(&self, intent: &str) -> bool {
        self.waiting_for.contains(intent)
    }

    /// Remove one pending intent.
    pub fn consume(&mut self, intent: &str) -> Result<(), HandlerError> {
        if !self.waiting_for.remove(intent) {
            tracing::error!(
                conversation = %self.id,
                intent,
                "Attempted to consume an intent the conversation is not waiting for"
            );
            return Err(HandlerError::NotAwaited {
                id: self.id,
                intent: intent.to_string(),
            });
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self) {
        self.finished = true;
        self.updated_at = Utc::now();
    }

    /// Done once explicitly finished or nothing is awaited any more.
    pub fn is_done(&self) -> bool {
        self.finished || self.waiting_for.is_empty()
    }

    pub fn return_target(&self) -> &ReturnTarget {
        match &self.kind {
            ConversationKind::Onboarding(ctx) => &ctx.return_to,
            ConversationKind::Nagging(ctx) => &ctx.return_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ReturnTarget {
        ReturnTarget {
            user: "U1".into(),
            channel: "C1".into(),
        }
    }

    fn onboarding() -> ConversationState {
        ConversationState::onboarding(OnboardingContext {
            return_to: target(),
            new_employee: "Ada".into(),
            start_date: Some("Monday".into()),
            account_info: None,
            phone_number: None,
            email: None,
        })
    }

    #[test]
    fn onboarding_waits_for_all_steps() {
        let conv = onboarding();
        for step in ONBOARDING_STEPS {
            assert!(conv.is_awaiting(step));
        }
        assert!(!conv.is_done());
    }

    #[test]
    fn consuming_every_step_marks_done() {
        let mut conv = onboarding();
        for step in ONBOARDING_STEPS {
            assert!(!conv.is_done());
            conv.consume(step).unwrap();
        }
        assert!(conv.waiting_for.is_empty());
        assert!(conv.is_done());
    }

    #[test]
    fn consuming_unknown_intent_fails() {
        let mut conv = onboarding();
        conv.consume("desk-setup").unwrap();
        let err = conv.consume("desk-setup").unwrap_err();
        assert!(matches!(err, HandlerError::NotAwaited { .. }));
    }

    #[test]
    fn explicit_completion_is_done() {
        let mut conv = onboarding();
        conv.complete();
        assert!(conv.is_done());
        assert!(!conv.waiting_for.is_empty());
    }

    #[test]
    fn kind_serializes_with_tag() {
        let conv = ConversationState::nagging(NaggingContext {
            return_to: target(),
            dm_channel: "DU2".into(),
            user_to_nag: "U2".into(),
            subject: "timesheet".into(),
            reminder_id: Uuid::new_v4(),
        });
        let json = serde_json::to_value(&conv).unwrap();
        assert_eq!(json["kind"]["type"], "nagging");
        assert_eq!(json["waiting_for"][0], NAG_RESPONSE);

        let parsed: ConversationState = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, conv);
    }
}
