//! OAuth authorization-flow collaborator.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::credential::Credential;
use crate::config::AuthConfig;
use crate::error::CredentialError;

/// Google OAuth consent endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Google OAuth token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// External authorization provider: builds prompt URIs and exchanges codes.
#[async_trait]
pub trait AuthorizationFlow: Send + Sync {
    /// Consent URI carrying `state` back to the callback receiver.
    fn authorize_url(&self, state: &str) -> Result<String, CredentialError>;

    /// Exchange an authorization code for a credential. Called once per code.
    async fn exchange(&self, code: &str) -> Result<Credential, CredentialError>;
}

/// Authorization-code flow against Google.
pub struct GoogleOAuthFlow {
    client_id: String,
    client_secret: SecretString,
    redirect_uri: String,
    scopes: Vec<String>,
    auth_url: String,
    token_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl GoogleOAuthFlow {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Point the flow at a different provider (tests, proxies).
    pub fn with_endpoints(mut self, auth_url: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self.token_url = token_url.into();
        self
    }

    fn ensure_configured(&self) -> Result<(), CredentialError> {
        if self.client_id.is_empty() {
            return Err(CredentialError::NotConfigured(
                "GOOGLE_CLIENT_ID is not set".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthorizationFlow for GoogleOAuthFlow {
    fn authorize_url(&self, state: &str) -> Result<String, CredentialError> {
        self.ensure_configured()?;
        let scope = self.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| CredentialError::NotConfigured(format!("invalid auth URL: {e}")))?;
        Ok(url.to_string())
    }

    async fn exchange(&self, code: &str) -> Result<Credential, CredentialError> {
        self.ensure_configured()?;
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::ExchangeFailed {
                provider: "google".to_string(),
                reason: format!("{status}: {body}"),
            });
        }

        let token: TokenResponse = response.json().await?;
        let mut credential = Credential::new(token.access_token);
        if let Some(refresh) = token.refresh_token {
            credential = credential.with_refresh_token(refresh);
        }
        if let Some(secs) = token.expires_in {
            credential = credential.with_expiry(Utc::now() + chrono::Duration::seconds(secs));
        }
        tracing::info!(
            has_refresh_token = credential.has_refresh_token(),
            "Exchanged authorization code"
        );
        Ok(credential)
    }
}
