//! New-employee onboarding conversation.

use std::sync::Arc;

use async_trait::async_trait;

use super::{HandlerRegistry, IntentHandler, Services};
use crate::error::HandlerError;
use crate::state::{ConversationKind, ConversationState, ONBOARDING_STEPS, OnboardingContext, Outcome, ReturnTarget};
use crate::task::Task;

/// Channel notified for each setup step and what it is asked to set up, in
/// step order.
const SETUP_CHANNELS: [(&str, &str, &str); 5] = [
    ("accounts-setup", "it", "accounts"),
    ("desk-setup", "facilities", "the desk"),
    ("phones-setup", "phones", "phones"),
    ("email-setup", "email", "email"),
    ("slack-setup", "slack-admins", "slack"),
];

pub(super) fn register(registry: &mut HandlerRegistry, services: &Services) {
    registry.register(Arc::new(OnboardingStart {
        admins: services.config.onboarding_admins.clone(),
    }));
    for step in ONBOARDING_STEPS {
        registry.register(Arc::new(SetupStep { intent: step }));
    }
}

/// Kicks off onboarding. Restricted to configured admins.
pub struct OnboardingStart {
    admins: Vec<String>,
}

impl OnboardingStart {
    pub fn new(admins: Vec<String>) -> Self {
        Self { admins }
    }
}

#[async_trait]
impl IntentHandler for OnboardingStart {
    fn intent(&self) -> &str {
        "onboarding-start"
    }

    fn example(&self) -> &str {
        "Start onboarding Ada Lovelace on Monday"
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let event = task.event();
        let out = task.output();
        if !self.admins.iter().any(|a| a == &event.user_id) {
            tracing::warn!(user = %event.user_id, "Unauthorized onboarding attempt");
            out.send(&event.channel_id, "You are not allowed to start onboarding")
                .await?;
            return Ok(Outcome::Done);
        }

        let entities = task.entities();
        let new_employee = entities
            .best_value("name")
            .unwrap_or("the new employee")
            .to_string();
        let start_date = entities.best_value("date").map(str::to_string);
        let starts = start_date.as_deref().unwrap_or("a date to be confirmed");

        for (_, channel, what) in SETUP_CHANNELS {
            out.send(
                channel,
                format!("Please begin setting up {what} for {new_employee}, who starts on {starts}"),
            )
            .await?;
        }
        out.send(
            &event.channel_id,
            format!("Onboarding started for {new_employee}"),
        )
        .await?;

        let conversation = ConversationState::onboarding(OnboardingContext {
            return_to: ReturnTarget {
                user: event.user_id.clone(),
                channel: event.channel_id.clone(),
            },
            new_employee,
            start_date,
            account_info: None,
            phone_number: None,
            email: None,
        });
        tracing::info!(conversation = %conversation.id, "Onboarding conversation opened");
        Ok(Outcome::Conversation(conversation))
    }
}

/// Acknowledges one finished setup step of an onboarding conversation.
pub struct SetupStep {
    intent: &'static str,
}

#[async_trait]
impl IntentHandler for SetupStep {
    fn intent(&self) -> &str {
        self.intent
    }

    fn example(&self) -> &str {
        match self.intent {
            "accounts-setup" => "Accounts are set up with username ada",
            "desk-setup" => "The desk is ready",
            "phones-setup" => "Phone is set up with number 555-0100",
            "email-setup" => "Email is set up as ada@example.com",
            _ => "Slack account is ready",
        }
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let missing = || HandlerError::MissingConversation {
            intent: self.intent.to_string(),
        };
        let mut conversation = task.event().conversation.clone().ok_or_else(missing)?;
        let ConversationKind::Onboarding(context) = &mut conversation.kind else {
            return Err(missing());
        };

        let entities = task.entities();
        let name = context.new_employee.clone();
        let ack = match self.intent {
            "accounts-setup" => {
                context.account_info = entities.best_value("account").map(str::to_string);
                format!(
                    "Account for {name} setup, with {} info",
                    context.account_info.as_deref().unwrap_or("no")
                )
            }
            "desk-setup" => format!("Desk for {name} setup"),
            "phones-setup" => {
                context.phone_number = entities.best_value("phone_number").map(str::to_string);
                format!(
                    "Phones for {name} setup, with {} number",
                    context.phone_number.as_deref().unwrap_or("no")
                )
            }
            "email-setup" => {
                context.email = entities.best_value("email").map(str::to_string);
                format!("Email for {name} setup")
            }
            _ => format!("Slack for {name} setup"),
        };
        let return_channel = context.return_to.channel.clone();
        let email = context.email.clone();

        let out = task.output();
        out.send(&return_channel, ack).await?;
        conversation.consume(self.intent)?;

        if conversation.is_done() {
            let notice = match email {
                Some(address) => format!("Email sent to {name} at {address}"),
                None => format!("Email sent to {name}"),
            };
            out.send(&return_channel, notice).await?;
            conversation.complete();
            tracing::info!(conversation = %conversation.id, "Onboarding finished");
        }
        Ok(Outcome::Conversation(conversation))
    }
}
