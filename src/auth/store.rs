//! Credential store: resolves identities to credentials and drives the
//! suspend/complete handshake of the authorization flow.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::credential::{Credential, IdentityKey};
use super::flow::AuthorizationFlow;
use super::token::{StateClaims, StateTokenCodec};
use crate::error::{CredentialError, TokenError};

/// Result of resolving an identity.
#[derive(Debug, Clone)]
pub enum Resolution {
    Ready(Credential),
    Pending(PendingAuthorization),
}

/// Authorization the user still has to grant.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// Key under which the caller must register its wait state.
    pub suspension_token: Uuid,
    /// Encoded `{suspension_token, identity}` carried through the provider.
    pub state_token: String,
    /// Where the user grants access.
    pub prompt_uri: String,
}

/// Outcome of a successful code exchange.
#[derive(Debug, Clone)]
pub struct CompletedAuthorization {
    pub suspension_token: Uuid,
    pub identity: IdentityKey,
    pub credential: Credential,
}

pub struct CredentialStore {
    credentials: RwLock<HashMap<IdentityKey, Credential>>,
    codec: StateTokenCodec,
    flow: Arc<dyn AuthorizationFlow>,
}

impl CredentialStore {
    pub fn new(codec: StateTokenCodec, flow: Arc<dyn AuthorizationFlow>) -> Self {
        Self {
            credentials: RwLock::new(HashMap::new()),
            codec,
            flow,
        }
    }

    /// Seed a credential, replacing any previous one for `identity`.
    pub async fn insert(&self, identity: IdentityKey, credential: Credential) {
        tracing::debug!(identity = %identity, "Stored credential");
        self.credentials.write().await.insert(identity, credential);
    }

    pub async fn get(&self, identity: &IdentityKey) -> Option<Credential> {
        self.credentials
            .read()
            .await
            .get(identity)
            .filter(|c| !c.is_expired())
            .cloned()
    }

    /// Return a usable credential, or mint a pending authorization for it.
    pub async fn resolve(&self, identity: &IdentityKey) -> Result<Resolution, CredentialError> {
        if let Some(credential) = self.get(identity).await {
            return Ok(Resolution::Ready(credential));
        }

        let suspension_token = Uuid::new_v4();
        let state_token = self.codec.encode(&StateClaims {
            suspension_token,
            identity_key: identity.clone(),
        })?;
        let prompt_uri = self.flow.authorize_url(&state_token)?;

        tracing::info!(
            identity = %identity,
            suspension = %suspension_token,
            "Credential missing, authorization required"
        );
        Ok(Resolution::Pending(PendingAuthorization {
            suspension_token,
            state_token,
            prompt_uri,
        }))
    }

    /// Decode an authorization-state token without touching the provider.
    pub fn decode_state(&self, state_token: &str) -> Result<StateClaims, TokenError> {
        self.codec.decode(state_token)
    }

    /// Finish an authorization: decode, exchange the code once, store the result.
    pub async fn complete(
        &self,
        code: &str,
        state_token: &str,
    ) -> Result<CompletedAuthorization, CredentialError> {
        let claims = self.decode_state(state_token)?;
        let credential = self.flow.exchange(code).await?;
        self.insert(claims.identity_key.clone(), credential.clone()).await;

        tracing::info!(
            identity = %claims.identity_key,
            suspension = %claims.suspension_token,
            "Authorization completed"
        );
        Ok(CompletedAuthorization {
            suspension_token: claims.suspension_token,
            identity: claims.identity_key,
            credential,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;

    #[derive(Default)]
    struct StubFlow {
        exchanges: AtomicUsize,
    }

    #[async_trait]
    impl AuthorizationFlow for StubFlow {
        fn authorize_url(&self, state: &str) -> Result<String, CredentialError> {
            Ok(format!("https://auth.test/consent?state={state}"))
        }

        async fn exchange(&self, code: &str) -> Result<Credential, CredentialError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::new(format!("token-for-{code}")))
        }
    }

    fn store() -> (CredentialStore, Arc<StubFlow>) {
        let flow = Arc::new(StubFlow::default());
        let codec = StateTokenCodec::from_base64_key(&StateTokenCodec::generate_key()).unwrap();
        (CredentialStore::new(codec, flow.clone()), flow)
    }

    #[tokio::test]
    async fn missing_credential_yields_pending() {
        let (store, _) = store();
        let identity = IdentityKey::new("user123");
        let Resolution::Pending(pending) = store.resolve(&identity).await.unwrap() else {
            panic!("expected pending authorization");
        };
        assert!(pending.prompt_uri.contains(&pending.state_token));

        let claims = store.decode_state(&pending.state_token).unwrap();
        assert_eq!(claims.suspension_token, pending.suspension_token);
        assert_eq!(claims.identity_key, identity);
    }

    #[tokio::test]
    async fn each_resolution_mints_a_fresh_token() {
        let (store, _) = store();
        let identity = IdentityKey::new("user123");
        let (Resolution::Pending(a), Resolution::Pending(b)) = (
            store.resolve(&identity).await.unwrap(),
            store.resolve(&identity).await.unwrap(),
        ) else {
            panic!("expected pending authorizations");
        };
        assert_ne!(a.suspension_token, b.suspension_token);
    }

    #[tokio::test]
    async fn complete_stores_credential_and_returns_token() {
        let (store, flow) = store();
        let identity = IdentityKey::new("user123");
        let Resolution::Pending(pending) = store.resolve(&identity).await.unwrap() else {
            panic!("expected pending authorization");
        };

        let done = store.complete("abc", &pending.state_token).await.unwrap();
        assert_eq!(done.suspension_token, pending.suspension_token);
        assert_eq!(done.identity, identity);
        assert_eq!(flow.exchanges.load(Ordering::SeqCst), 1);

        let Resolution::Ready(cred) = store.resolve(&identity).await.unwrap() else {
            panic!("expected stored credential");
        };
        assert_eq!(cred.access_token(), "token-for-abc");
    }

    #[tokio::test]
    async fn bad_state_skips_exchange() {
        let (store, flow) = store();
        let err = store.complete("abc", "garbage").await.unwrap_err();
        assert!(matches!(err, CredentialError::InvalidState(_)));
        assert_eq!(flow.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_credential_is_not_ready() {
        let (store, _) = store();
        let identity = IdentityKey::new("hal");
        store
            .insert(
                identity.clone(),
                Credential::new("old").with_expiry(Utc::now() - chrono::Duration::minutes(1)),
            )
            .await;
        assert!(matches!(
            store.resolve(&identity).await.unwrap(),
            Resolution::Pending(_)
        ));
    }
}
