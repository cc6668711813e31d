//! Turns classified messages into submitted tasks.

use std::sync::Arc;

use crate::auth::IdentityKey;
use crate::channels::OutputHandle;
use crate::error::DispatchError;
use crate::handlers::HandlerRegistry;
use crate::runtime::{RouterHandle, TaskSubmitter};
use crate::task::{CredentialContext, Entities, EventSnapshot};

/// The seam between the messaging transport and the runtime.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    submitter: TaskSubmitter,
    router: RouterHandle,
    output: OutputHandle,
    service_identity: IdentityKey,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        submitter: TaskSubmitter,
        router: RouterHandle,
        output: OutputHandle,
        service_identity: IdentityKey,
    ) -> Self {
        Self {
            registry,
            submitter,
            router,
            output,
            service_identity,
        }
    }

    /// Build a task for `intent` and queue it.
    ///
    /// Attaches the conversation awaiting `intent`, if there is one, and
    /// picks the credential identity the handler asks for.
    pub async fn dispatch(
        &self,
        intent: &str,
        event: EventSnapshot,
        entities: Entities,
    ) -> Result<(), DispatchError> {
        let handler = self.registry.get(intent).ok_or_else(|| {
            tracing::warn!(intent, "No handler for intent");
            crate::error::UnknownHandler {
                intent: intent.to_string(),
            }
        })?;

        let conversation = self.router.find_conversation(intent).await?;
        if let Some(conv) = &conversation {
            tracing::debug!(intent, conversation = %conv.id, "Matched conversation");
        }
        let event = event.with_conversation(conversation);

        let identity = if handler.per_user_credentials() {
            IdentityKey::new(event.user_id.clone())
        } else {
            self.service_identity.clone()
        };

        let task = self.registry.task(
            intent,
            event,
            entities,
            CredentialContext::new(identity),
            self.output.clone(),
        )?;
        tracing::info!(intent, user = %task.event().user_id, "Dispatching task");
        self.submitter.submit_wait(task).await?;
        Ok(())
    }

    /// Reply with the list of things the assistant can do.
    pub async fn reply_help(&self, channel: &str) {
        if let Err(e) = self.output.send(channel, self.registry.help_prompt()).await {
            tracing::warn!(error = %e, "Could not send help prompt");
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}
