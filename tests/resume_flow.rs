//! End-to-end flows through the running runtime: suspend on missing
//! credentials, resume through the HTTP callback, retries of stalled
//! handlers, and conversation routing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::mpsc;
use tower::ServiceExt;

use hal_assist::auth::{
    AuthorizationFlow, Credential, CredentialStore, IdentityKey, StateTokenCodec,
};
use hal_assist::callback::{CallbackState, callback_routes};
use hal_assist::channels::{OutgoingMessage, output_channel};
use hal_assist::config::{AssistantConfig, RuntimeConfig};
use hal_assist::error::{CredentialError, HandlerError};
use hal_assist::handlers::{DriveClient, DriveFile, HeadcountReport, ReportField, StatsClient};
use hal_assist::runtime::{Reminders, RouterStats};
use hal_assist::task::{Entities, EventSnapshot, Task};
use hal_assist::{Dispatcher, HandlerRegistry, IntentHandler, Outcome, Runtime, Services};

const WAIT: Duration = Duration::from_secs(5);

struct StubFlow;

#[async_trait]
impl AuthorizationFlow for StubFlow {
    fn authorize_url(&self, state: &str) -> Result<String, CredentialError> {
        Ok(format!("https://auth.test/consent?state={state}"))
    }

    async fn exchange(&self, code: &str) -> Result<Credential, CredentialError> {
        Ok(Credential::new(format!("token-for-{code}")))
    }
}

/// Drive that only answers callers holding the exchanged token.
struct StubDrive;

#[async_trait]
impl DriveClient for StubDrive {
    async fn list_files(&self, credential: &Credential) -> Result<Vec<DriveFile>, HandlerError> {
        if credential.access_token() != "token-for-abc" {
            return Err(HandlerError::Drive("unauthorized".into()));
        }
        Ok(vec![
            DriveFile {
                id: "1".into(),
                name: "budget.xlsx".into(),
            },
            DriveFile {
                id: "2".into(),
                name: "notes.txt".into(),
            },
        ])
    }

    async fn create_file(
        &self,
        _credential: &Credential,
        name: &str,
    ) -> Result<DriveFile, HandlerError> {
        Ok(DriveFile {
            id: "3".into(),
            name: name.into(),
        })
    }

    async fn delete_file(&self, _credential: &Credential, _id: &str) -> Result<(), HandlerError> {
        Ok(())
    }
}

struct StubStats;

#[async_trait]
impl StatsClient for StubStats {
    async fn headcount(&self, _event: &EventSnapshot) -> Result<HeadcountReport, HandlerError> {
        let field = |value: &str| ReportField {
            title: String::new(),
            value: value.into(),
        };
        Ok(HeadcountReport {
            text: "Headcount".into(),
            fields: vec![field("Office"), field("Count"), field("MA"), field("41"), field("LN"), field("12")],
        })
    }
}

fn runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        workers: 2,
        invocation_timeout: Duration::from_millis(200),
        max_retries: 2,
        heartbeat_interval: Duration::from_millis(20),
        ..RuntimeConfig::default()
    }
}

struct Harness {
    runtime: Runtime,
    dispatcher: Dispatcher,
    messages: mpsc::Receiver<OutgoingMessage>,
}

fn start(registry: HandlerRegistry, store: Arc<CredentialStore>, reminders: Arc<Reminders>) -> Harness {
    let registry = Arc::new(registry);
    let runtime = Runtime::start(&runtime_config(), registry.clone(), store, reminders);
    let (output, messages) = output_channel(64);
    let dispatcher = Dispatcher::new(
        registry,
        runtime.submitter(),
        runtime.router(),
        output,
        IdentityKey::new("hal"),
    );
    Harness {
        runtime,
        dispatcher,
        messages,
    }
}

fn builtin_harness() -> Harness {
    builtin_harness_with(AssistantConfig::default())
}

fn builtin_harness_with(config: AssistantConfig) -> Harness {
    let codec = StateTokenCodec::from_base64_key(&StateTokenCodec::generate_key()).unwrap();
    let store = Arc::new(CredentialStore::new(codec, Arc::new(StubFlow)));
    let reminders = Arc::new(Reminders::new());
    let services = Services {
        credentials: store.clone(),
        drive: Arc::new(StubDrive),
        stats: Arc::new(StubStats),
        reminders: reminders.clone(),
        config,
    };
    start(HandlerRegistry::with_builtins(&services), store, reminders)
}

/// Receive messages until one matches.
async fn expect_message(
    rx: &mut mpsc::Receiver<OutgoingMessage>,
    matches: impl Fn(&OutgoingMessage) -> bool,
) -> OutgoingMessage {
    tokio::time::timeout(WAIT, async {
        loop {
            let msg = rx.recv().await.expect("output channel closed");
            if matches(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("expected message never arrived")
}

/// Poll router stats until `done` holds.
async fn wait_for_stats(h: &Harness, done: impl Fn(&RouterStats) -> bool) -> RouterStats {
    tokio::time::timeout(WAIT, async {
        loop {
            let stats = h.runtime.router().stats().await.unwrap();
            if done(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("router never reached the expected state")
}

/// Ask for the drive listing as user123 and return the state token from the
/// authorization prompt.
async fn suspend_drive_list(h: &mut Harness) -> String {
    h.dispatcher
        .dispatch(
            "get-drive-list",
            EventSnapshot::new("user123", "C1", "what is in my drive"),
            Entities::new(),
        )
        .await
        .unwrap();

    let notice = expect_message(&mut h.messages, |m| m.channel == "C1").await;
    assert!(notice.text.contains("direct message"));
    let prompt = expect_message(&mut h.messages, |m| m.channel == "Duser123").await;
    let (_, state) = prompt
        .text
        .split_once("state=")
        .expect("prompt carries the state token");

    wait_for_stats(h, |s| s.waits == 1).await;
    state.to_string()
}

async fn callback(h: &Harness, query: &str) -> StatusCode {
    let app = callback_routes(CallbackState {
        events: h.runtime.state_sender(),
        router: h.runtime.router(),
    });
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/oauth/callback?{query}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    response.status()
}

fn encode_query_value(value: &str) -> String {
    value.replace('=', "%3D")
}

#[tokio::test]
async fn missing_credential_suspends_the_task() {
    let mut h = builtin_harness();
    suspend_drive_list(&mut h).await;

    let stats = h.runtime.router().stats().await.unwrap();
    assert_eq!((stats.waits, stats.resumed), (1, 0));
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn authorization_callback_resumes_and_lists_files() {
    let mut h = builtin_harness();
    let state = suspend_drive_list(&mut h).await;

    let status = callback(&h, &format!("code=abc&state={}", encode_query_value(&state))).await;
    assert_eq!(status, StatusCode::OK);

    let listing = expect_message(&mut h.messages, |m| m.channel == "C1").await;
    assert_eq!(listing.text, "```budget.xlsx\nnotes.txt\n```");

    let stats = wait_for_stats(&h, |s| s.resumed == 1).await;
    assert_eq!(stats.waits, 0);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn declined_authorization_is_never_resumed() {
    let mut h = builtin_harness();
    let state = suspend_drive_list(&mut h).await;

    let status = callback(
        &h,
        &format!("error=access_denied&state={}", encode_query_value(&state)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let stats = wait_for_stats(&h, |s| s.declined == 1).await;
    assert_eq!((stats.waits, stats.resumed), (0, 0));
    let quiet = tokio::time::timeout(Duration::from_millis(200), h.messages.recv()).await;
    assert!(quiet.is_err(), "no reply expected after a decline");
    h.runtime.shutdown().await;
}

/// Announces itself, then never finishes.
struct Hangs {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl IntentHandler for Hangs {
    fn intent(&self) -> &str {
        "hang"
    }

    fn example(&self) -> &str {
        "hang"
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        task.output().send(&task.event().channel_id, "working on it").await?;
        std::future::pending::<()>().await;
        Ok(Outcome::Done)
    }
}

#[tokio::test]
async fn stalled_handler_is_retried_until_the_limit() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Hangs {
        calls: calls.clone(),
    }));
    let codec = StateTokenCodec::from_base64_key(&StateTokenCodec::generate_key()).unwrap();
    let store = Arc::new(CredentialStore::new(codec, Arc::new(StubFlow)));
    let mut h = start(registry, store, Arc::new(Reminders::new()));

    h.dispatcher
        .dispatch("hang", EventSnapshot::new("U1", "C1", "hang"), Entities::new())
        .await
        .unwrap();

    // One original attempt plus two retries, each repeating the side effect.
    for _ in 0..3 {
        let msg = expect_message(&mut h.messages, |m| m.channel == "C1").await;
        assert_eq!(msg.text, "working on it");
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::timeout(WAIT, h.runtime.shutdown())
        .await
        .expect("shutdown completes with stalled invocations");
}

#[tokio::test]
async fn nag_response_goes_to_the_most_recent_conversation() {
    let mut h = builtin_harness();

    for (target, subject) in [("U2", "the report"), ("U3", "the slides")] {
        let before = h.runtime.router().stats().await.unwrap().conversations;
        h.dispatcher
            .dispatch(
                "nag-users",
                EventSnapshot::new("U1", "C1", "nag"),
                Entities::new()
                    .with("user", target, 0.9)
                    .with("subject", subject, 0.9),
            )
            .await
            .unwrap();
        wait_for_stats(&h, |s| s.conversations == before + 1).await;
    }

    h.dispatcher
        .dispatch(
            "nag-response",
            EventSnapshot::new("U3", "DU3", "done"),
            Entities::new(),
        )
        .await
        .unwrap();

    let finished = expect_message(&mut h.messages, |m| m.text.contains("finished")).await;
    assert_eq!(finished.channel, "C1");
    assert_eq!(finished.text, "<@U3> finished the slides");

    wait_for_stats(&h, |s| s.conversations == 1).await;
    let remaining = h
        .runtime
        .router()
        .find_conversation("nag-response")
        .await
        .unwrap()
        .expect("older conversation still open");
    let hal_assist::state::ConversationKind::Nagging(context) = &remaining.kind else {
        panic!("expected a nagging conversation");
    };
    assert_eq!(context.user_to_nag, "U2");
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn back_to_back_setup_steps_are_both_recorded() {
    let mut h = builtin_harness_with(AssistantConfig {
        onboarding_admins: vec!["U1".into()],
        ..AssistantConfig::default()
    });

    h.dispatcher
        .dispatch(
            "onboarding-start",
            EventSnapshot::new("U1", "C-hr", "onboard Ada"),
            Entities::new().with("name", "Ada", 0.9),
        )
        .await
        .unwrap();
    wait_for_stats(&h, |s| s.conversations == 1).await;
    let id = h
        .runtime
        .router()
        .find_conversation("desk-setup")
        .await
        .unwrap()
        .expect("onboarding conversation open")
        .id;

    // Both tasks are built from the same snapshot of the conversation.
    for (intent, user) in [("desk-setup", "U-facilities"), ("phones-setup", "U-phones")] {
        h.dispatcher
            .dispatch(
                intent,
                EventSnapshot::new(user, "C-ops", "done"),
                Entities::new().with("phone_number", "555-0100", 0.9),
            )
            .await
            .unwrap();
    }
    for _ in 0..2 {
        expect_message(&mut h.messages, |m| m.channel == "C-hr" && m.text.contains("setup")).await;
    }

    let conversation = tokio::time::timeout(WAIT, async {
        loop {
            let conversation = h.runtime.router().conversation(id).await.unwrap().unwrap();
            if conversation.waiting_for.len() == 3 {
                return conversation;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both setup steps recorded");
    assert!(!conversation.is_awaiting("desk-setup"));
    assert!(!conversation.is_awaiting("phones-setup"));
    let hal_assist::state::ConversationKind::Onboarding(context) = &conversation.kind else {
        panic!("expected an onboarding conversation");
    };
    assert_eq!(context.phone_number.as_deref(), Some("555-0100"));
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn headcount_for_one_office() {
    let mut h = builtin_harness();
    h.dispatcher
        .dispatch(
            "galatean-count",
            EventSnapshot::new("U1", "C1", "how many galateans are in london"),
            Entities::new().with("location", "London", 0.9),
        )
        .await
        .unwrap();

    let reply = expect_message(&mut h.messages, |m| m.channel == "C1").await;
    assert_eq!(reply.text, "Headcount\nOffice\nCount\nLN\n12");
    h.runtime.shutdown().await;
}
