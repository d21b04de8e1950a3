//! Access token resolution for selected credentials
//!
//! API-key credentials open their sealed secret and use it directly. OAuth
//! credentials reuse a cached access token while it has more than a minute
//! left, otherwise exchange the refresh token at the token endpoint and
//! persist the result. `resolve` never fails: every problem collapses into
//! `AccessToken::Unavailable` after a warning with the credential id.

use std::sync::Arc;

use common::{Cipher, Secret};
use oauth_client::ClientPair;
use tracing::{debug, info, warn};

use crate::model::{Credential, SecretKind};
use crate::now_millis;
use crate::store::{Store, truncate};

/// Cached tokens closer than this to expiry are refreshed first.
const REFRESH_THRESHOLD_MS: u64 = 60_000;

/// Longest error excerpt written to the log.
const LOG_ERROR_LEN: usize = 200;

/// System-wide OAuth client, used when a credential carries none.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            token_endpoint: oauth_client::GOOGLE_TOKEN_ENDPOINT.to_string(),
            client_id: String::new(),
            client_secret: None,
        }
    }
}

/// Outcome of token resolution.
#[derive(Debug)]
pub enum AccessToken {
    Ready(Secret<String>),
    Unavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Token(#[from] oauth_client::Error),

    #[error("sealed secret unusable: {0}")]
    Cipher(#[from] common::Error),

    #[error("credential is not refreshable")]
    NotRefreshable,

    #[error("no OAuth client configured")]
    NoClient,
}

impl RefreshError {
    /// Whether retrying the same credential later is pointless.
    pub fn is_permanent(&self) -> bool {
        match self {
            RefreshError::Token(e) => e.is_permanent(),
            RefreshError::Cipher(_) | RefreshError::NotRefreshable | RefreshError::NoClient => {
                true
            }
        }
    }
}

/// Freshly exchanged token, already sealed for storage.
#[derive(Debug)]
pub struct RefreshedToken {
    pub access_token: Secret<String>,
    pub sealed: String,
    pub expires_at: u64,
}

pub struct TokenBroker {
    store: Arc<dyn Store>,
    cipher: Arc<dyn Cipher>,
    http_client: reqwest::Client,
    oauth: OAuthSettings,
}

impl TokenBroker {
    pub fn new(
        store: Arc<dyn Store>,
        cipher: Arc<dyn Cipher>,
        http_client: reqwest::Client,
        oauth: OAuthSettings,
    ) -> Self {
        Self {
            store,
            cipher,
            http_client,
            oauth,
        }
    }

    pub fn cipher(&self) -> &Arc<dyn Cipher> {
        &self.cipher
    }

    /// Usable access token for `credential`, or `Unavailable`.
    pub async fn resolve(&self, credential: &Credential) -> AccessToken {
        match credential.kind {
            SecretKind::ApiKey => match self.cipher.open(&credential.sealed_secret) {
                Ok(key) => AccessToken::Ready(key),
                Err(e) => {
                    self.warn_unavailable(credential.id, &e.to_string());
                    AccessToken::Unavailable
                }
            },
            SecretKind::OAuth => {
                if let Some(cached) = self.cached(credential) {
                    debug!(credential_id = credential.id, "using cached access token");
                    return AccessToken::Ready(cached);
                }
                match self.refresh(credential).await {
                    Ok(token) => {
                        if let Err(e) = self
                            .store
                            .set_access_token(credential.id, token.sealed, Some(token.expires_at))
                            .await
                        {
                            warn!(credential_id = credential.id, error = %e, "failed to persist refreshed token");
                        }
                        info!(credential_id = credential.id, "access token refreshed");
                        AccessToken::Ready(token.access_token)
                    }
                    Err(e) => {
                        self.warn_unavailable(credential.id, &e.to_string());
                        AccessToken::Unavailable
                    }
                }
            }
        }
    }

    fn cached(&self, credential: &Credential) -> Option<Secret<String>> {
        let sealed = credential.sealed_access_token.as_deref()?;
        let expires_at = credential.access_expires_at?;
        if expires_at <= now_millis() + REFRESH_THRESHOLD_MS {
            return None;
        }
        self.cipher.open(sealed).ok()
    }

    /// Exchange the credential's refresh token. Nothing is persisted here.
    pub async fn refresh(&self, credential: &Credential) -> Result<RefreshedToken, RefreshError> {
        if credential.kind != SecretKind::OAuth {
            return Err(RefreshError::NotRefreshable);
        }
        let refresh = self.cipher.open(&credential.sealed_secret)?;

        // A credential-specific client only counts when both halves are present.
        let own_secret = match (&credential.client_id, &credential.sealed_client_secret) {
            (Some(id), Some(sealed)) if !id.trim().is_empty() => {
                Some((id.as_str(), self.cipher.open(sealed)?))
            }
            _ => None,
        };
        let response = match &own_secret {
            Some((client_id, secret)) => {
                let pair = ClientPair {
                    client_id: *client_id,
                    client_secret: secret.expose(),
                };
                self.exchange(refresh.expose(), pair).await?
            }
            None => {
                let secret = self
                    .oauth
                    .client_secret
                    .as_ref()
                    .filter(|_| !self.oauth.client_id.is_empty())
                    .ok_or(RefreshError::NoClient)?;
                let pair = ClientPair {
                    client_id: &self.oauth.client_id,
                    client_secret: secret.expose(),
                };
                self.exchange(refresh.expose(), pair).await?
            }
        };

        let sealed = self.cipher.seal(&response.access_token)?;
        Ok(RefreshedToken {
            expires_at: expiry_after(now_millis(), response.expires_in),
            access_token: Secret::new(response.access_token),
            sealed,
        })
    }

    async fn exchange(
        &self,
        refresh: &str,
        pair: ClientPair<'_>,
    ) -> oauth_client::Result<oauth_client::TokenResponse> {
        oauth_client::refresh_access_token(
            &self.http_client,
            &self.oauth.token_endpoint,
            refresh,
            pair,
        )
        .await
    }

    fn warn_unavailable(&self, credential_id: u64, error: &str) {
        warn!(
            credential_id,
            error = %truncate(error, LOG_ERROR_LEN),
            "access token unavailable"
        );
    }
}

/// Absolute expiry for a token valid `expires_in_secs` from `now`.
fn expiry_after(now: u64, expires_in_secs: u64) -> u64 {
    now.saturating_add(expires_in_secs.saturating_mul(1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::{Tier, Visibility};
    use axum::Router;
    use axum::extract::Form;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use common::PlaintextCipher;
    use std::collections::HashMap;

    async fn token_endpoint(Form(form): Form<HashMap<String, String>>) -> axum::response::Response {
        match form.get("refresh_token").map(String::as_str) {
            Some("rt-good") => {
                let client = form.get("client_id").cloned().unwrap_or_default();
                axum::Json(serde_json::json!({
                    "access_token": format!("at-for-{client}"),
                    "expires_in": 3600
                }))
                .into_response()
            }
            Some("rt-forever") => axum::Json(serde_json::json!({
                "access_token": "at-forever",
                "expires_in": u64::MAX
            }))
            .into_response(),
            _ => (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#).into_response(),
        }
    }

    async fn spawn_endpoint() -> String {
        let app = Router::new().fallback(token_endpoint);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/token")
    }

    fn broker(store: Arc<MemoryStore>, endpoint: String) -> TokenBroker {
        TokenBroker::new(
            store,
            Arc::new(PlaintextCipher),
            reqwest::Client::new(),
            OAuthSettings {
                token_endpoint: endpoint,
                client_id: "system-client".into(),
                client_secret: Some(Secret::new("system-secret".into())),
            },
        )
    }

    fn oauth(refresh: &str) -> Credential {
        let mut c = Credential::new(SecretKind::OAuth, refresh.into(), Tier::Gemini25, Visibility::Public);
        c.project_id = Some("proj".into());
        c
    }

    #[tokio::test]
    async fn api_key_is_returned_directly() {
        let store = Arc::new(MemoryStore::new());
        let b = broker(store, "http://127.0.0.1:9/token".into());
        let c = Credential::new(SecretKind::ApiKey, "AIza-key".into(), Tier::Gemini25, Visibility::Public);
        match b.resolve(&c).await {
            AccessToken::Ready(key) => assert_eq!(key.expose(), "AIza-key"),
            AccessToken::Unavailable => panic!("expected key"),
        }
    }

    #[tokio::test]
    async fn oauth_refresh_persists_token() {
        let store = Arc::new(MemoryStore::new());
        let b = broker(store.clone(), spawn_endpoint().await);
        let id = store.insert_credential(oauth("rt-good")).await.unwrap();
        let c = store.get_credential(id).await.unwrap().unwrap();

        match b.resolve(&c).await {
            AccessToken::Ready(token) => assert_eq!(token.expose(), "at-for-system-client"),
            AccessToken::Unavailable => panic!("expected token"),
        }
        let stored = store.get_credential(id).await.unwrap().unwrap();
        assert_eq!(stored.sealed_access_token.as_deref(), Some("at-for-system-client"));
        assert!(stored.access_expires_at.unwrap() > now_millis());
    }

    #[test]
    fn expiry_saturates() {
        assert_eq!(expiry_after(1_000, 60), 61_000);
        assert_eq!(expiry_after(1_000, u64::MAX), u64::MAX);
        assert_eq!(expiry_after(u64::MAX - 1, 1), u64::MAX);
    }

    #[tokio::test]
    async fn huge_expires_in_does_not_overflow() {
        let store = Arc::new(MemoryStore::new());
        let b = broker(store, spawn_endpoint().await);
        let token = b.refresh(&oauth("rt-forever")).await.unwrap();
        assert_eq!(token.access_token.expose(), "at-forever");
        assert_eq!(token.expires_at, u64::MAX);
    }

    #[tokio::test]
    async fn credential_client_pair_takes_precedence() {
        let store = Arc::new(MemoryStore::new());
        let b = broker(store, spawn_endpoint().await);
        let mut c = oauth("rt-good");
        c.client_id = Some("own-client".into());
        c.sealed_client_secret = Some("own-secret".into());

        let token = b.refresh(&c).await.unwrap();
        assert_eq!(token.access_token.expose(), "at-for-own-client");
    }

    #[tokio::test]
    async fn cached_token_skips_exchange() {
        let store = Arc::new(MemoryStore::new());
        // unreachable endpoint: any exchange would fail
        let b = broker(store, "http://127.0.0.1:9/token".into());
        let mut c = oauth("rt-bad");
        c.sealed_access_token = Some("at-cached".into());
        c.access_expires_at = Some(now_millis() + 10 * 60_000);

        match b.resolve(&c).await {
            AccessToken::Ready(token) => assert_eq!(token.expose(), "at-cached"),
            AccessToken::Unavailable => panic!("expected cached token"),
        }
    }

    #[tokio::test]
    async fn failures_collapse_to_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let b = broker(store, spawn_endpoint().await);
        let mut c = oauth("rt-revoked");
        c.sealed_access_token = Some("at-stale".into());
        c.access_expires_at = Some(now_millis() + 1_000);

        assert!(matches!(b.resolve(&c).await, AccessToken::Unavailable));
        let err = b.refresh(&c).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn missing_system_client_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let b = TokenBroker::new(
            store,
            Arc::new(PlaintextCipher),
            reqwest::Client::new(),
            OAuthSettings::default(),
        );
        assert!(matches!(b.refresh(&oauth("rt-good")).await, Err(RefreshError::NoClient)));
        assert!(matches!(b.resolve(&oauth("rt-good")).await, AccessToken::Unavailable));
    }
}
