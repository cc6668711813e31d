//! Intent handlers and the registry that turns intents into tasks.

pub mod drive;
pub mod misc;
pub mod nag;
pub mod onboarding;
pub mod stats;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::{Credential, CredentialStore, Resolution};
use crate::channels::OutputHandle;
use crate::config::AssistantConfig;
use crate::error::{HandlerError, UnknownHandler};
use crate::runtime::Reminders;
use crate::state::{Outcome, WaitState};
use crate::task::{CredentialContext, Entities, EventSnapshot, Task};

pub use drive::{DriveClient, DriveFile, GoogleDrive};
pub use stats::{HeadcountReport, ReportField, ScriptsStats, StatsClient};

/// A unit of intent-specific behavior.
#[async_trait]
pub trait IntentHandler: Send + Sync {
    /// Intent identifier this handler answers to.
    fn intent(&self) -> &str;

    /// Example phrase shown in the help prompt.
    fn example(&self) -> &str;

    /// Whether credentials are resolved for the requesting user instead of
    /// the service identity.
    fn per_user_credentials(&self) -> bool {
        false
    }

    /// Perform the side effects for `task` and report what is left.
    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError>;
}

/// Collaborators the built-in handlers need.
#[derive(Clone)]
pub struct Services {
    pub credentials: Arc<CredentialStore>,
    pub drive: Arc<dyn DriveClient>,
    pub stats: Arc<dyn StatsClient>,
    pub reminders: Arc<Reminders>,
    pub config: AssistantConfig,
}

/// Mapping of intent identifiers to handlers. Built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn IntentHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler.
    pub fn with_builtins(services: &Services) -> Self {
        let mut registry = Self::new();
        misc::register(&mut registry);
        drive::register(&mut registry, services);
        onboarding::register(&mut registry, services);
        nag::register(&mut registry, services);
        stats::register(&mut registry, services);
        tracing::info!(handlers = registry.len(), "Registered built-in handlers");
        registry
    }

    /// Register a handler, replacing any previous one for the same intent.
    pub fn register(&mut self, handler: Arc<dyn IntentHandler>) {
        let intent = handler.intent().to_string();
        if self.handlers.insert(intent.clone(), handler).is_some() {
            tracing::warn!(intent = %intent, "Replaced existing handler");
        } else {
            tracing::debug!("Registered handler: {}", intent);
        }
    }

    pub fn get(&self, intent: &str) -> Option<Arc<dyn IntentHandler>> {
        self.handlers.get(intent).cloned()
    }

    pub fn contains(&self, intent: &str) -> bool {
        self.handlers.contains_key(intent)
    }

    pub fn intents(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Build a task for `intent`. The only way tasks come into existence.
    pub fn task(
        &self,
        intent: &str,
        event: EventSnapshot,
        entities: Entities,
        credentials: CredentialContext,
        output: OutputHandle,
    ) -> Result<Task, UnknownHandler> {
        let handler = self.get(intent).ok_or_else(|| UnknownHandler {
            intent: intent.to_string(),
        })?;
        Ok(Task::new(handler, event, entities, credentials, output))
    }

    /// Reply used when no intent could be matched.
    pub fn help_prompt(&self) -> String {
        let mut prompt = String::from("I'm sorry, I didn't quite understand. Try one of these:\n");
        for handler in self.handlers.values() {
            prompt.push_str(&format!("> `{}`\n", handler.example()));
        }
        prompt
    }
}

/// Result of asking for the credential a task needs.
pub(crate) enum Access {
    Granted(Credential),
    /// The user was prompted; the handler must return this outcome.
    Suspended(Outcome),
}

/// Use the task's credential, or prompt the user and suspend the task.
///
/// The prompt URI only goes to the user's private channel. A short notice is
/// posted when the request came from a shared channel.
pub(crate) async fn require_credential(
    store: &CredentialStore,
    task: &Task,
) -> Result<Access, HandlerError> {
    let context = task.credentials();
    if let Some(credential) = context.credential.as_ref().filter(|c| !c.is_expired()) {
        return Ok(Access::Granted(credential.clone()));
    }

    match store.resolve(&context.identity).await? {
        Resolution::Ready(credential) => Ok(Access::Granted(credential)),
        Resolution::Pending(pending) => {
            let event = task.event();
            if !event.is_direct() {
                task.output()
                    .send(
                        &event.channel_id,
                        "I'll send you the authorization link in a direct message",
                    )
                    .await?;
            }
            task.output()
                .send(
                    &event.dm_channel,
                    format!("Click here to authorize {}", pending.prompt_uri),
                )
                .await?;
            Ok(Access::Suspended(Outcome::Wait(WaitState::from_task(
                task,
                pending.suspension_token,
            ))))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;

    use super::*;
    use crate::auth::{AuthorizationFlow, StateTokenCodec};
    use crate::error::CredentialError;

    pub struct StubFlow;

    #[async_trait]
    impl AuthorizationFlow for StubFlow {
        fn authorize_url(&self, state: &str) -> Result<String, CredentialError> {
            Ok(format!("https://auth.test/consent?state={state}"))
        }

        async fn exchange(&self, code: &str) -> Result<Credential, CredentialError> {
            Ok(Credential::new(format!("token-for-{code}")))
        }
    }

    pub fn credential_store() -> Arc<CredentialStore> {
        let codec = StateTokenCodec::from_base64_key(&StateTokenCodec::generate_key()).unwrap();
        Arc::new(CredentialStore::new(codec, Arc::new(StubFlow)))
    }
}
