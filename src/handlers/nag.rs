//! Nagging: remind someone until they confirm a task is done.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{HandlerRegistry, IntentHandler, Services};
use crate::channels::direct_channel;
use crate::error::HandlerError;
use crate::runtime::Reminders;
use crate::state::{ConversationKind, ConversationState, NAG_RESPONSE, NaggingContext, Outcome, ReturnTarget};
use crate::task::Task;

pub(super) fn register(registry: &mut HandlerRegistry, services: &Services) {
    registry.register(Arc::new(NagUsers::new(
        services.reminders.clone(),
        services.config.nag_interval,
    )));
    registry.register(Arc::new(NagResponse::new(services.reminders.clone())));
}

pub struct NagUsers {
    reminders: Arc<Reminders>,
    interval: Duration,
}

impl NagUsers {
    pub fn new(reminders: Arc<Reminders>, interval: Duration) -> Self {
        Self {
            reminders,
            interval,
        }
    }
}

#[async_trait]
impl IntentHandler for NagUsers {
    fn intent(&self) -> &str {
        "nag-users"
    }

    fn example(&self) -> &str {
        "Nag John Casey about hal"
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let event = task.event();
        let out = task.output();
        let entities = task.entities();

        let Some(target) = entities
            .best_value("user")
            .or_else(|| entities.best_value("name"))
        else {
            out.send(&event.channel_id, "Who should I nag?").await?;
            return Ok(Outcome::Done);
        };
        let subject = entities.best_value("subject").unwrap_or("your task").to_string();
        let dm = direct_channel(target);

        out.send(
            &dm,
            format!(
                "Hi <@{target}>, <@{}> asked me to remind you about {subject}. \
                 Let me know when it's done.",
                event.user_id
            ),
        )
        .await?;

        let reminder_id = self
            .reminders
            .start(
                self.interval,
                out.clone(),
                dm.clone(),
                format!("Reminder: {subject} is still waiting on you"),
            )
            .await;

        out.send(
            &event.channel_id,
            format!("I'll nag <@{target}> about {subject} until it's done"),
        )
        .await?;

        let conversation = ConversationState::nagging(NaggingContext {
            return_to: ReturnTarget {
                user: event.user_id.clone(),
                channel: event.channel_id.clone(),
            },
            dm_channel: dm,
            user_to_nag: target.to_string(),
            subject,
            reminder_id,
        });
        tracing::info!(conversation = %conversation.id, nagged = target, "Nagging started");
        Ok(Outcome::Conversation(conversation))
    }
}

pub struct NagResponse {
    reminders: Arc<Reminders>,
}

impl NagResponse {
    pub fn new(reminders: Arc<Reminders>) -> Self {
        Self { reminders }
    }
}

#[async_trait]
impl IntentHandler for NagResponse {
    fn intent(&self) -> &str {
        NAG_RESPONSE
    }

    fn example(&self) -> &str {
        "I did the task"
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let missing = || HandlerError::MissingConversation {
            intent: NAG_RESPONSE.to_string(),
        };
        let mut conversation = task.event().conversation.clone().ok_or_else(missing)?;
        let ConversationKind::Nagging(context) = &conversation.kind else {
            return Err(missing());
        };
        let context = context.clone();

        self.reminders.stop(context.reminder_id).await;
        let out = task.output();
        out.send(&context.dm_channel, "Thanks, I'll stop reminding you")
            .await?;
        out.send(
            &context.return_to.channel,
            format!("<@{}> finished {}", context.user_to_nag, context.subject),
        )
        .await?;

        conversation.consume(NAG_RESPONSE)?;
        conversation.complete();
        Ok(Outcome::Conversation(conversation))
    }
}
