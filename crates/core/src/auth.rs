//! Credential resolution for MCP server connections (C1).
//!
//! A two-phase split (`resolve()` refreshes, `current()` reads) over a
//! cache keyed by credential identity, with single-flight refresh
//! coalescing so concurrent callers racing to use an expired OAuth2
//! token don't each hit the authorization server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

/// Safety margin subtracted from a token's advertised expiry: a token is
/// treated as expired 30s before the authorization server actually
/// invalidates it, so in-flight requests don't race a wire-level 401.
const EXPIRY_SAFETY_MARGIN: chrono::Duration = chrono::Duration::seconds(30);

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("token endpoint returned an error: {0}")]
    Transport(String),
    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// How a given MCP server's requests are authenticated.
#[derive(Debug, Clone)]
pub enum AuthConfig {
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        header: String,
        value: String,
    },
    OAuth2ClientCredentials {
        auth_server_url: String,
        realm: String,
        client_id: String,
        client_secret: String,
        grant_type: String,
    },
}

/// A resolved credential ready to attach to an outgoing request: which
/// header it goes in, and what value it carries. `ApiKey` schemes name
/// their own header; everything else authenticates via `Authorization`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAuth {
    pub header_name: String,
    pub header_value: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Utc::now() + EXPIRY_SAFETY_MARGIN < self.expires_at
    }
}

/// Response shape expected back from an OAuth2 `client_credentials` token
/// endpoint.
#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Caches resolved auth headers per server, refreshing OAuth2 tokens
/// on demand and coalescing concurrent refreshes for the same key.
pub struct TokenCache {
    http: reqwest::Client,
    entries: RwLock<HashMap<String, Arc<Mutex<Option<CachedToken>>>>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves the `Authorization`-style header value for `server_name`
    /// under `config`, returning `None` when the server needs no auth.
    ///
    /// For static schemes (`Bearer`, `Basic`, `ApiKey`) this never touches
    /// the network. For `OAuth2ClientCredentials` it returns a cached
    /// token if still valid, otherwise fetches a fresh one — with at most
    /// one in-flight fetch per composite key, even under concurrent calls.
    pub async fn token_for(
        &self,
        config: &AuthConfig,
        server_name: &str,
    ) -> Result<Option<ResolvedAuth>, AuthError> {
        let auth = |header_value: String| {
            Some(ResolvedAuth {
                header_name: "Authorization".to_string(),
                header_value,
            })
        };
        match config {
            AuthConfig::None => Ok(None),
            AuthConfig::Bearer(token) => Ok(auth(format!("Bearer {token}"))),
            AuthConfig::Basic { username, password } => {
                let encoded = base64_basic(username, password);
                Ok(auth(format!("Basic {encoded}")))
            }
            AuthConfig::ApiKey { header, value } => Ok(Some(ResolvedAuth {
                header_name: header.clone(),
                header_value: value.clone(),
            })),
            AuthConfig::OAuth2ClientCredentials {
                auth_server_url,
                realm,
                client_id,
                client_secret,
                grant_type,
            } => {
                let key = composite_key(client_id, realm, auth_server_url);
                let slot = self.slot_for(&key).await;
                let mut guard = slot.lock().await;

                if let Some(cached) = guard.as_ref() {
                    if cached.is_valid() {
                        return Ok(auth(format!("Bearer {}", cached.value)));
                    }
                }

                tracing::debug!(server = server_name, %key, "refreshing oauth2 token");
                let token_url = oauth2_token_url(auth_server_url, realm);
                let fresh = self
                    .fetch_token(&token_url, client_id, client_secret, grant_type)
                    .await?;
                let value = fresh.value.clone();
                *guard = Some(fresh);
                Ok(auth(format!("Bearer {value}")))
            }
        }
    }

    async fn slot_for(&self, key: &str) -> Arc<Mutex<Option<CachedToken>>> {
        if let Some(slot) = self.entries.read().await.get(key) {
            return slot.clone();
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn fetch_token(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        grant_type: &str,
    ) -> Result<CachedToken, AuthError> {
        let response = self
            .http
            .post(token_url)
            .timeout(Duration::from_secs(10))
            .form(&[
                ("grant_type", grant_type),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Transport(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        Ok(CachedToken {
            value: parsed.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
        })
    }
}

fn composite_key(client_id: &str, realm: &str, auth_server_url: &str) -> String {
    format!("{client_id}@{realm}@{auth_server_url}")
}

/// Builds the Keycloak-style token endpoint URL:
/// `{authServerUrl}/realms/{realm}/protocol/openid-connect/token`.
fn oauth2_token_url(auth_server_url: &str, realm: &str) -> String {
    format!(
        "{}/realms/{}/protocol/openid-connect/token",
        auth_server_url.trim_end_matches('/'),
        realm
    )
}

fn base64_basic(username: &str, password: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
}
