//! MCP server configuration.
//!
//! `McpServerConfig` describes one server, narrowed to HTTP/JSON-RPC
//! endpoints — this client speaks only Streamable HTTP, so SSE/stdio
//! transport variants don't apply here. The facade owns the TOML list
//! these get parsed from.

use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_auth")]
    pub auth: RawAuthConfig,
    /// Explicit override for the webcrawl-variant header quirk. When
    /// absent, the client infers it from `name`/response hints.
    #[serde(default)]
    pub is_webcrawl_variant: Option<bool>,
}

fn default_auth() -> RawAuthConfig {
    RawAuthConfig::None
}

/// Serializable mirror of [`AuthConfig`] — TOML can't tag an enum the way
/// the runtime type needs, so config files describe auth declaratively
/// and `McpServerConfig::auth_config` converts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "camelCase")]
pub enum RawAuthConfig {
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        header: String,
        value: String,
    },
    #[serde(rename = "oauth2ClientCredentials")]
    OAuth2ClientCredentials {
        auth_server_url: String,
        realm: String,
        client_id: String,
        client_secret: String,
        #[serde(default = "default_grant_type")]
        grant_type: String,
    },
}

fn default_grant_type() -> String {
    "client_credentials".to_string()
}

impl McpServerConfig {
    pub fn auth_config(&self) -> AuthConfig {
        match &self.auth {
            RawAuthConfig::None => AuthConfig::None,
            RawAuthConfig::Bearer { token } => AuthConfig::Bearer(token.clone()),
            RawAuthConfig::Basic { username, password } => AuthConfig::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            RawAuthConfig::ApiKey { header, value } => AuthConfig::ApiKey {
                header: header.clone(),
                value: value.clone(),
            },
            RawAuthConfig::OAuth2ClientCredentials {
                auth_server_url,
                realm,
                client_id,
                client_secret,
                grant_type,
            } => AuthConfig::OAuth2ClientCredentials {
                auth_server_url: auth_server_url.clone(),
                realm: realm.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                grant_type: grant_type.clone(),
            },
        }
    }

    /// Whether the webcrawl triple-header quirk applies, per the explicit
    /// override or else inferred from the server name.
    pub fn webcrawl_variant(&self) -> bool {
        self.is_webcrawl_variant
            .unwrap_or_else(|| self.name.to_ascii_lowercase().contains("webcrawl"))
    }
}
