//! Error types for Hal Assist.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the assistant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State token error: {0}")]
    Token(#[from] TokenError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Authorization-state token errors.
///
/// Every variant is treated by the router as "no matching authorization".
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Token is not valid base64")]
    Encoding,

    #[error("Token is malformed: {0}")]
    Malformed(String),

    #[error("Token signature does not match")]
    BadSignature,

    #[error("Token could not be decrypted")]
    Decrypt,

    #[error("Token expired {age:?} after issue (max {max_age:?})")]
    Expired { age: Duration, max_age: Duration },

    #[error("Token payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Credential store and authorization-provider errors.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Invalid authorization state: {0}")]
    InvalidState(#[from] TokenError),

    #[error("Authorization provider is not configured: {0}")]
    NotConfigured(String),

    #[error("Code exchange with {provider} failed: {reason}")]
    ExchangeFailed { provider: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised by intent handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Failed to send message to {channel}")]
    Output { channel: String },

    #[error("Handler {intent} needs a conversation but none was attached")]
    MissingConversation { intent: String },

    #[error("Conversation {id} is not waiting for {intent}")]
    NotAwaited { id: Uuid, intent: String },

    #[error("Drive request failed: {0}")]
    Drive(String),

    #[error("Headcount request failed: {0}")]
    Stats(String),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Handler {intent} failed: {reason}")]
    Failed { intent: String, reason: String },
}

/// Errors returned when a task cannot be placed on the inbound queue.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Inbound queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("Inbound queue is closed")]
    Closed,
}

/// Per-event failures inside the state router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No suspended task for suspension token {token}")]
    MissingWaitState { token: Uuid },

    #[error("Suspended intent {0} is no longer registered")]
    UnknownHandler(#[from] UnknownHandler),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Failed to resubmit resumed task: {0}")]
    Resubmit(#[from] SubmitError),

    #[error("Authorization code exchange did not finish within {0:?}")]
    ExchangeTimeout(Duration),

    #[error("State router is not running")]
    Stopped,
}

/// A task was requested for an intent with no registered handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no handler registered for intent '{intent}'")]
pub struct UnknownHandler {
    pub intent: String,
}

/// Errors surfaced to the message-handling side when dispatching an intent.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    UnknownHandler(#[from] UnknownHandler),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Result type alias for the assistant.
pub type Result<T> = std::result::Result<T, Error>;
