//! State router: the single owner of the wait and conversation registries.
//!
//! Consumes the state queue one event at a time. Other components reach the
//! registries only through [`RouterHandle`] queries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pool::TaskSubmitter;
use super::registry::{Applied, ConversationRegistry, WaitRegistry};
use super::reminder::Reminders;
use crate::auth::CredentialStore;
use crate::error::{CredentialError, RouterError};
use crate::handlers::HandlerRegistry;
use crate::state::{ConversationKind, ConversationState, Outcome, StateEvent};

/// Registry sizes and lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub waits: usize,
    pub conversations: usize,
    pub resumed: u64,
    pub declined: u64,
    pub discarded: u64,
    pub expired: u64,
}

/// Read-only questions answered by the router task.
#[derive(Debug)]
pub enum RouterQuery {
    FindConversation {
        intent: String,
        reply: oneshot::Sender<Option<ConversationState>>,
    },
    Conversation {
        id: Uuid,
        reply: oneshot::Sender<Option<ConversationState>>,
    },
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
}

/// Cloneable query handle.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterQuery>,
}

impl RouterHandle {
    /// Conversation awaiting `intent`, if any.
    pub async fn find_conversation(
        &self,
        intent: &str,
    ) -> Result<Option<ConversationState>, RouterError> {
        self.ask(|reply| RouterQuery::FindConversation {
            intent: intent.to_string(),
            reply,
        })
        .await
    }

    pub async fn conversation(&self, id: Uuid) -> Result<Option<ConversationState>, RouterError> {
        self.ask(|reply| RouterQuery::Conversation { id, reply }).await
    }

    pub async fn stats(&self) -> Result<RouterStats, RouterError> {
        self.ask(|reply| RouterQuery::Stats { reply }).await
    }

    async fn ask<T>(
        &self,
        query: impl FnOnce(oneshot::Sender<T>) -> RouterQuery,
    ) -> Result<T, RouterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(query(reply))
            .await
            .map_err(|_| RouterError::Stopped)?;
        rx.await.map_err(|_| RouterError::Stopped)
    }
}

/// Expiry and time bounds of the router.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub wait_ttl: Duration,
    pub conversation_ttl: Duration,
    pub sweep_interval: Duration,
    /// Upper bound on one authorization-code exchange.
    pub exchange_timeout: Duration,
}

pub struct StateRouter {
    waits: WaitRegistry,
    conversations: ConversationRegistry,
    registry: Arc<HandlerRegistry>,
    store: Arc<CredentialStore>,
    submitter: TaskSubmitter,
    reminders: Arc<Reminders>,
    settings: RouterSettings,
    stats: RouterStats,
}

impl StateRouter {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<CredentialStore>,
        submitter: TaskSubmitter,
        reminders: Arc<Reminders>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            waits: WaitRegistry::new(),
            conversations: ConversationRegistry::new(),
            registry,
            store,
            submitter,
            reminders,
            settings,
            stats: RouterStats::default(),
        }
    }

    /// Run the router until `shutdown` fires, then drain pending events.
    pub fn spawn(
        mut self,
        mut events: mpsc::Receiver<StateEvent>,
        mut queries: mpsc::Receiver<RouterQuery>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweeper = tokio::time::interval(self.settings.sweep_interval);
            sweeper.tick().await;
            tracing::info!("State router started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    Some(event) = events.recv() => self.process(event).await,
                    Some(query) = queries.recv() => self.answer(query),
                    _ = sweeper.tick() => self.sweep(Utc::now()).await,
                }
            }

            let mut drained = 0usize;
            while let Ok(event) = events.try_recv() {
                self.process(event).await;
                drained += 1;
            }
            tracing::info!(drained, "State router stopped");
        })
    }

    /// Handle one event, logging any failure. Never fails the loop.
    pub async fn process(&mut self, event: StateEvent) {
        let kind = event.kind();
        if let Err(e) = self.handle_event(event).await {
            match e {
                RouterError::MissingWaitState { token } => {
                    tracing::error!(token = %token, "Authorization completed for an unknown suspension");
                }
                e => tracing::error!(event = kind, error = %e, "State event failed"),
            }
        }
    }

    pub async fn handle_event(&mut self, event: StateEvent) -> Result<(), RouterError> {
        match event {
            StateEvent::AuthorizationCallback { code, state } => match code {
                Some(code) => self.resume(&code, &state).await,
                None => {
                    self.decline(&state);
                    Ok(())
                }
            },
            StateEvent::StateUpdate(outcome) => {
                self.update(outcome).await;
                Ok(())
            }
        }
    }

    async fn resume(&mut self, code: &str, state: &str) -> Result<(), RouterError> {
        let timeout = self.settings.exchange_timeout;
        let completed = match tokio::time::timeout(timeout, self.store.complete(code, state)).await
        {
            Err(_) => return Err(RouterError::ExchangeTimeout(timeout)),
            Ok(Ok(completed)) => completed,
            Ok(Err(CredentialError::InvalidState(e))) => {
                tracing::warn!(error = %e, "Undecodable authorization state; callback discarded");
                self.stats.discarded += 1;
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
        };

        let token = completed.suspension_token;
        let wait = self
            .waits
            .get(&token)
            .cloned()
            .ok_or(RouterError::MissingWaitState { token })?;

        let task = self.registry.task(
            &wait.intent,
            wait.event,
            wait.entities,
            wait.credentials.with_credential(completed.credential),
            wait.output,
        )?;
        // The wait stays registered until the resumed task is actually queued.
        self.submitter.submit(task)?;
        self.waits.remove(&token);
        self.stats.resumed += 1;
        tracing::info!(token = %token, intent = %wait.intent, "Suspended task resumed");
        Ok(())
    }

    fn decline(&mut self, state: &str) {
        match self.store.decode_state(state) {
            Ok(claims) => {
                let token = claims.suspension_token;
                if self.waits.remove(&token).is_some() {
                    self.stats.declined += 1;
                    tracing::info!(token = %token, identity = %claims.identity_key, "Authorization declined; wait discarded");
                } else {
                    tracing::warn!(token = %token, "Decline for an unknown suspension");
                }
            }
            Err(e) => {
                self.stats.discarded += 1;
                tracing::warn!(error = %e, "Undecodable authorization state; callback discarded");
            }
        }
    }

    async fn update(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done => {}
            Outcome::Wait(wait) => self.waits.insert(wait),
            Outcome::Conversation(conversation) => {
                let id = conversation.id;
                match self.conversations.apply(conversation) {
                    Applied::Removed(finished) => self.release(&finished).await,
                    Applied::Inserted => tracing::info!(conversation = %id, "Conversation opened"),
                    Applied::Updated => tracing::debug!(conversation = %id, "Conversation updated"),
                }
            }
        }
    }

    /// Stop anything a departing conversation left running.
    async fn release(&self, conversation: &ConversationState) {
        if let ConversationKind::Nagging(context) = &conversation.kind {
            self.reminders.stop(context.reminder_id).await;
        }
    }

    fn answer(&self, query: RouterQuery) {
        // A dropped reply receiver only means the asker gave up.
        match query {
            RouterQuery::FindConversation { intent, reply } => {
                let _ = reply.send(self.conversations.find(&intent).cloned());
            }
            RouterQuery::Conversation { id, reply } => {
                let _ = reply.send(self.conversations.get(&id).cloned());
            }
            RouterQuery::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            waits: self.waits.len(),
            conversations: self.conversations.len(),
            ..self.stats
        }
    }

    async fn sweep(&mut self, now: chrono::DateTime<Utc>) {
        for wait in self.waits.expire(now, self.settings.wait_ttl) {
            self.stats.expired += 1;
            tracing::info!(token = %wait.token, intent = %wait.intent, "Suspended task expired");
        }
        for conversation in self.conversations.expire(now, self.settings.conversation_ttl) {
            self.stats.expired += 1;
            tracing::info!(
                conversation = %conversation.id,
                kind = conversation.kind.name(),
                "Idle conversation expired"
            );
            self.release(&conversation).await;
        }
    }
}

/// Create the query channel.
pub(crate) fn query_channel(capacity: usize) -> (RouterHandle, mpsc::Receiver<RouterQuery>) {
    let (tx, rx) = mpsc::channel(capacity);
    (RouterHandle { tx }, rx)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::auth::{AuthorizationFlow, Credential, IdentityKey, Resolution, StateTokenCodec};
    use crate::error::SubmitError;
    use crate::channels::output_channel;
    use crate::error::HandlerError;
    use crate::handlers::{IntentHandler, test_support};
    use crate::runtime::pool::{Submission, inbound_queue};
    use crate::state::{NAG_RESPONSE, NaggingContext, ReturnTarget, WaitState};
    use crate::task::{CredentialContext, Entities, EventSnapshot, Task};

    struct Files;

    #[async_trait]
    impl IntentHandler for Files {
        fn intent(&self) -> &str {
            "get-drive-list"
        }

        fn example(&self) -> &str {
            "files"
        }

        fn per_user_credentials(&self) -> bool {
            true
        }

        async fn handle(&self, _task: &Task) -> Result<Outcome, HandlerError> {
            Ok(Outcome::Done)
        }
    }

    /// Provider whose token endpoint never answers.
    struct StalledFlow;

    #[async_trait]
    impl AuthorizationFlow for StalledFlow {
        fn authorize_url(&self, state: &str) -> Result<String, CredentialError> {
            Ok(format!("https://auth.test/consent?state={state}"))
        }

        async fn exchange(&self, _code: &str) -> Result<Credential, CredentialError> {
            std::future::pending().await
        }
    }

    struct Fixture {
        router: StateRouter,
        store: Arc<CredentialStore>,
        registry: Arc<HandlerRegistry>,
        reminders: Arc<Reminders>,
        inbound: mpsc::Receiver<Submission>,
    }

    fn settings() -> RouterSettings {
        RouterSettings {
            wait_ttl: Duration::from_secs(3600),
            conversation_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            exchange_timeout: Duration::from_secs(5),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(test_support::credential_store(), 8, settings())
    }

    fn fixture_with(store: Arc<CredentialStore>, capacity: usize, settings: RouterSettings) -> Fixture {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Files));
        let registry = Arc::new(registry);
        let reminders = Arc::new(Reminders::new());
        let (submitter, inbound) = inbound_queue(capacity);
        let router = StateRouter::new(
            registry.clone(),
            store.clone(),
            submitter,
            reminders.clone(),
            settings,
        );
        Fixture {
            router,
            store,
            registry,
            reminders,
            inbound,
        }
    }

    /// Suspend a drive task for user123 and return the wait plus its state token.
    async fn suspend(f: &mut Fixture) -> (WaitState, String) {
        let Resolution::Pending(pending) = f
            .store
            .resolve(&IdentityKey::new("user123"))
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };
        let (out, _rx) = output_channel(4);
        let task = f
            .registry
            .task(
                "get-drive-list",
                EventSnapshot::new("user123", "C1", "what's in my drive"),
                Entities::new().with("scope", "all", 0.9),
                CredentialContext::new(IdentityKey::new("user123")),
                out,
            )
            .unwrap();
        let wait = WaitState::from_task(&task, pending.suspension_token);
        f.router
            .handle_event(StateEvent::StateUpdate(Outcome::Wait(wait.clone())))
            .await
            .unwrap();
        (wait, pending.state_token)
    }

    #[tokio::test]
    async fn callback_with_code_resumes_original_task() {
        let mut f = fixture();
        let (wait, state) = suspend(&mut f).await;
        assert_eq!(f.router.stats().waits, 1);

        f.router
            .handle_event(StateEvent::AuthorizationCallback {
                code: Some("abc".into()),
                state,
            })
            .await
            .unwrap();

        let resumed = f.inbound.try_recv().unwrap();
        assert_eq!(resumed.attempt, 0);
        assert_eq!(resumed.task.intent(), "get-drive-list");
        assert_eq!(*resumed.task.event(), wait.event);
        assert_eq!(*resumed.task.entities(), wait.entities);
        assert_eq!(
            resumed
                .task
                .credentials()
                .credential
                .as_ref()
                .map(|c| c.access_token()),
            Some("token-for-abc")
        );
        let stats = f.router.stats();
        assert_eq!((stats.waits, stats.resumed), (0, 1));
    }

    #[tokio::test]
    async fn full_inbound_queue_keeps_the_wait() {
        let mut f = fixture_with(test_support::credential_store(), 1, settings());
        let (wait, state) = suspend(&mut f).await;

        // Occupy the only slot of the inbound queue.
        let (out, _rx) = output_channel(1);
        let filler = f
            .registry
            .task(
                "get-drive-list",
                EventSnapshot::new("U9", "C9", "filler"),
                Entities::new(),
                CredentialContext::new(IdentityKey::new("U9")),
                out,
            )
            .unwrap();
        f.router.submitter.submit(filler).unwrap();

        let err = f
            .router
            .handle_event(StateEvent::AuthorizationCallback {
                code: Some("abc".into()),
                state,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Resubmit(SubmitError::Full { capacity: 1 })));
        assert_eq!(f.router.stats().waits, 1);
        assert_eq!(f.router.stats().resumed, 0);
        assert!(f.router.waits.get(&wait.token).is_some());

        // Once the queue drains the suspended task can still be resumed.
        f.inbound.try_recv().unwrap();
        let pending = f.store.resolve(&IdentityKey::new("user123")).await.unwrap();
        assert!(matches!(pending, Resolution::Ready(_)));
    }

    #[tokio::test]
    async fn slow_exchange_is_bounded() {
        let store = Arc::new(CredentialStore::new(
            StateTokenCodec::from_base64_key(&StateTokenCodec::generate_key()).unwrap(),
            Arc::new(StalledFlow),
        ));
        let mut f = fixture_with(
            store,
            8,
            RouterSettings {
                exchange_timeout: Duration::from_millis(50),
                ..settings()
            },
        );
        let (_, state) = suspend(&mut f).await;

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            f.router.handle_event(StateEvent::AuthorizationCallback {
                code: Some("abc".into()),
                state,
            }),
        )
        .await
        .expect("exchange bounded by the router")
        .unwrap_err();
        assert!(matches!(err, RouterError::ExchangeTimeout(_)));
        assert_eq!(f.router.stats().waits, 1);
        assert!(f.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn decline_discards_wait_without_resume() {
        let mut f = fixture();
        let (_, state) = suspend(&mut f).await;
        f.router
            .handle_event(StateEvent::AuthorizationCallback { code: None, state })
            .await
            .unwrap();
        assert!(f.inbound.try_recv().is_err());
        assert_eq!(f.router.stats().waits, 0);
        assert_eq!(f.router.stats().declined, 1);
    }

    #[tokio::test]
    async fn missing_wait_is_reported() {
        let mut f = fixture();
        let Resolution::Pending(pending) = f
            .store
            .resolve(&IdentityKey::new("user123"))
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };
        let err = f
            .router
            .handle_event(StateEvent::AuthorizationCallback {
                code: Some("abc".into()),
                state: pending.state_token,
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, RouterError::MissingWaitState { token } if token == pending.suspension_token)
        );
    }

    #[tokio::test]
    async fn garbage_state_is_discarded() {
        let mut f = fixture();
        suspend(&mut f).await;
        f.router
            .handle_event(StateEvent::AuthorizationCallback {
                code: Some("abc".into()),
                state: "not-a-token".into(),
            })
            .await
            .unwrap();
        assert!(f.inbound.try_recv().is_err());
        assert_eq!(f.router.stats().waits, 1);
        assert_eq!(f.router.stats().discarded, 1);
    }

    #[tokio::test]
    async fn finished_nag_stops_reminder() {
        let mut f = fixture();
        let (out, _rx) = output_channel(4);
        let reminder_id = f
            .reminders
            .start(Duration::from_secs(3600), out, "DU2", "ping")
            .await;
        let mut conversation = ConversationState::nagging(NaggingContext {
            return_to: ReturnTarget {
                user: "U1".into(),
                channel: "C1".into(),
            },
            dm_channel: "DU2".into(),
            user_to_nag: "U2".into(),
            subject: "report".into(),
            reminder_id,
        });
        f.router
            .handle_event(StateEvent::StateUpdate(conversation.clone().into()))
            .await
            .unwrap();
        assert_eq!(f.router.stats().conversations, 1);

        conversation.consume(NAG_RESPONSE).unwrap();
        f.router
            .handle_event(StateEvent::StateUpdate(conversation.into()))
            .await
            .unwrap();
        assert_eq!(f.router.stats().conversations, 0);
        assert!(!f.reminders.is_running(reminder_id).await);
    }

    #[tokio::test]
    async fn sweep_expires_stale_waits() {
        let mut f = fixture();
        suspend(&mut f).await;
        f.router
            .sweep(Utc::now() + chrono::Duration::hours(2))
            .await;
        let stats = f.router.stats();
        assert_eq!((stats.waits, stats.expired), (0, 1));
    }

    #[tokio::test]
    async fn queries_are_answered_by_the_running_router() {
        let f = fixture();
        let (state_tx, state_rx) = mpsc::channel(4);
        let (handle, queries) = query_channel(4);
        let shutdown = CancellationToken::new();
        let task = f.router.spawn(state_rx, queries, shutdown.clone());

        let conversation = ConversationState::nagging(NaggingContext {
            return_to: ReturnTarget {
                user: "U1".into(),
                channel: "C1".into(),
            },
            dm_channel: "DU2".into(),
            user_to_nag: "U2".into(),
            subject: "report".into(),
            reminder_id: Uuid::new_v4(),
        });
        let id = conversation.id;
        state_tx
            .send(StateEvent::StateUpdate(conversation.into()))
            .await
            .unwrap();

        // Events are handled ahead of queries, so the conversation is visible.
        let found = handle.find_conversation(NAG_RESPONSE).await.unwrap();
        assert_eq!(found.map(|c| c.id), Some(id));
        assert!(handle.conversation(id).await.unwrap().is_some());
        assert_eq!(handle.stats().await.unwrap().conversations, 1);

        shutdown.cancel();
        task.await.unwrap();
        assert!(matches!(handle.stats().await, Err(RouterError::Stopped)));
    }
}
