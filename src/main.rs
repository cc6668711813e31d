use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

use hal_assist::auth::{Credential, CredentialStore, GoogleOAuthFlow, IdentityKey, StateTokenCodec};
use hal_assist::callback::{self, CallbackState};
use hal_assist::channels::cli::CLI_CHANNEL;
use hal_assist::channels::{CliChannel, output_channel};
use hal_assist::config::{AssistantConfig, AuthConfig, RuntimeConfig, ServerConfig, StatsConfig};
use hal_assist::handlers::{GoogleDrive, ScriptsStats};
use hal_assist::runtime::Reminders;
use hal_assist::{Dispatcher, HandlerRegistry, Runtime, Services};

const OUTPUT_CAPACITY: usize = 256;

/// Log to stderr, or to a daily file under `HAL_LOG_DIR` when it is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("HAL_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "hal-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let runtime_config = RuntimeConfig::from_env()?;
    let auth_config = AuthConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;
    let assistant_config = AssistantConfig::from_env()?;
    let stats_config = StatsConfig::from_env()?;

    eprintln!("HAL assistant v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", runtime_config.workers);
    eprintln!(
        "   Callback: http://0.0.0.0:{}/oauth/callback",
        server_config.port
    );
    eprintln!("   Type `intent key=value ...` and press Enter. /quit to exit.\n");

    // ── Credentials ─────────────────────────────────────────────────────
    let codec = StateTokenCodec::from_base64_key(auth_config.token_key.expose_secret())
        .context("FERNET_KEY is not a valid token key")?
        .with_max_age(auth_config.state_token_max_age);
    let flow = Arc::new(GoogleOAuthFlow::new(&auth_config));
    let store = Arc::new(CredentialStore::new(codec, flow));

    let service_identity = IdentityKey::new(auth_config.service_identity.clone());
    if let Some(token) = &auth_config.service_access_token {
        store
            .insert(
                service_identity.clone(),
                Credential::new(token.expose_secret()),
            )
            .await;
        tracing::info!(identity = %service_identity, "Seeded service credential");
    }

    // ── Handlers ────────────────────────────────────────────────────────
    let reminders = Arc::new(Reminders::new());
    let services = Services {
        credentials: store.clone(),
        drive: Arc::new(GoogleDrive::new()),
        stats: Arc::new(ScriptsStats::new(&stats_config)),
        reminders: reminders.clone(),
        config: assistant_config,
    };
    let registry = Arc::new(HandlerRegistry::with_builtins(&services));
    eprintln!("   Intents: {}", registry.len());

    // ── Runtime ─────────────────────────────────────────────────────────
    let runtime = Runtime::start(&runtime_config, registry.clone(), store, reminders);

    let cli = CliChannel::new();
    let (output, output_rx) = output_channel(OUTPUT_CAPACITY);
    let printer = cli.spawn_printer(output_rx);

    let dispatcher = Dispatcher::new(
        registry,
        runtime.submitter(),
        runtime.router(),
        output.clone(),
        service_identity,
    );

    // ── Callback receiver ───────────────────────────────────────────────
    let server_shutdown = CancellationToken::new();
    let server = {
        let state = CallbackState {
            events: runtime.state_sender(),
            router: runtime.router(),
        };
        let token = server_shutdown.clone();
        let port = server_config.port;
        tokio::spawn(async move {
            let stop = async move { token.cancelled().await };
            if let Err(e) = callback::serve(state, port, stop).await {
                tracing::error!(port, error = %e, "Callback receiver failed");
            }
        })
    };

    // ── Main loop ───────────────────────────────────────────────────────
    let mut commands = cli.start();
    loop {
        let command = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down...");
                break;
            }
            command = commands.recv() => match command {
                Some(command) => command,
                None => {
                    tracing::info!("Input closed, shutting down...");
                    break;
                }
            },
        };

        if matches!(command.intent.as_str(), "/quit" | "/exit") {
            break;
        }
        if !dispatcher.registry().contains(&command.intent) {
            dispatcher.reply_help(CLI_CHANNEL).await;
            continue;
        }
        if let Err(e) = dispatcher
            .dispatch(&command.intent, command.event, command.entities)
            .await
        {
            tracing::error!(intent = %command.intent, error = %e, "Dispatch failed");
            let _ = output.send_error(CLI_CHANNEL, &e).await;
        }
    }

    server_shutdown.cancel();
    if let Err(e) = server.await {
        tracing::error!(error = %e, "Callback receiver task failed");
    }
    runtime.shutdown().await;

    // Detached handler invocations may still hold output handles.
    printer.abort();
    Ok(())
}
