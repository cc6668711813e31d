//! Handler outcomes and the events carried on the state queue.

pub mod conversation;
pub mod wait;

pub use conversation::{
    ConversationKind, ConversationState, NAG_RESPONSE, NaggingContext, ONBOARDING_STEPS,
    OnboardingContext, ReturnTarget,
};
pub use wait::WaitState;

/// What a handler invocation produced. Exactly one per invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler finished all of its side effects.
    Done,
    /// The handler started or advanced a multi-turn exchange.
    Conversation(ConversationState),
    /// The handler is suspended until external authorization completes.
    Wait(WaitState),
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Conversation(_) => "conversation",
            Self::Wait(_) => "wait",
        }
    }
}

impl From<ConversationState> for Outcome {
    fn from(state: ConversationState) -> Self {
        Self::Conversation(state)
    }
}

impl From<WaitState> for Outcome {
    fn from(state: WaitState) -> Self {
        Self::Wait(state)
    }
}

/// Events consumed by the state router.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// The authorization provider redirected back to the callback receiver.
    /// `code` is absent when the user declined.
    AuthorizationCallback { code: Option<String>, state: String },
    /// A handler returned a wait or conversation state.
    StateUpdate(Outcome),
}

impl StateEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthorizationCallback { .. } => "authorization-callback",
            Self::StateUpdate(_) => "state-update",
        }
    }
}
