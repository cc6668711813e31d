//! HTTP receiver for OAuth redirects.
//!
//! Only forwards what the provider sent onto the state queue; the state
//! router decides what it means.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::runtime::RouterHandle;
use crate::state::StateEvent;

/// Body returned for every accepted callback.
pub const SUCCESS_BODY: &str = "<h1>Authentication Successful</h1>";

/// Shared state for callback routes.
#[derive(Clone)]
pub struct CallbackState {
    pub events: mpsc::Sender<StateEvent>,
    pub router: RouterHandle,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user declined.
    pub error: Option<String>,
}

/// GET / and GET /oauth/callback
async fn oauth_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    let Some(token) = params.state.filter(|s| !s.is_empty()) else {
        tracing::warn!("Callback without state parameter");
        return (StatusCode::BAD_REQUEST, "missing state parameter").into_response();
    };
    if let Some(error) = &params.error {
        tracing::info!(error = %error, "Provider reported an authorization error");
    }

    let event = StateEvent::AuthorizationCallback {
        code: params.code.filter(|c| !c.is_empty()),
        state: token,
    };
    if state.events.send(event).await.is_err() {
        tracing::error!("State queue closed; callback dropped");
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    Html(SUCCESS_BODY).into_response()
}

/// GET /health
async fn health(State(state): State<CallbackState>) -> impl IntoResponse {
    match state.router.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "waits": stats.waits,
            "conversations": stats.conversations,
            "resumed": stats.resumed,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "stopped", "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Build the callback routes.
pub fn callback_routes(state: CallbackState) -> Router {
    Router::new()
        .route("/", get(oauth_callback))
        .route("/oauth/callback", get(oauth_callback))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the callback routes on `port` until `shutdown` resolves.
pub async fn serve(
    state: CallbackState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "Callback receiver listening");
    axum::serve(listener, callback_routes(state))
        .with_graceful_shutdown(shutdown)
        .await
}
