//! MCP handshake state machine and session-id bookkeeping (C2).
//!
//! Grounded in the reqwest-direct JSON-RPC shape of `McpHttpSession`
//! (loom's `tool/source/mcp_session/http.rs`): one client, one POST per
//! JSON-RPC call, session id threaded through a header on every request
//! after the handshake. Extended with ordered session-id extraction, a
//! webcrawl triple-header quirk, and an alternate-session retry ladder
//! for servers whose handshake is nonstandard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{AuthConfig, TokenCache};

use super::McpError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_WRITE_TIMEOUT: Duration = Duration::from_secs(360);

/// Connect/read timeout pair, overridable via the `mcp.connectTimeoutSeconds` /
/// `mcp.readTimeoutSeconds` configuration keys.
#[derive(Debug, Clone, Copy)]
pub struct McpTimeouts {
    pub connect: Duration,
    pub read_write: Duration,
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            read_write: DEFAULT_READ_WRITE_TIMEOUT,
        }
    }
}

/// Header names checked/sent for session identification.
const HEADER_MCP_SESSION_ID: &str = "Mcp-Session-Id";
const HEADER_X_MCP_SESSION_ID: &str = "X-Mcp-Session-Id";
const HEADER_SESSION_ID: &str = "Session-Id";

/// Where a session id came from — kept for diagnostics, not behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdSource {
    Header,
    Body,
    Failsafe,
}

/// The negotiated state for one MCP server connection. Reused across
/// requests until a protocol error forces a re-handshake; never
/// persisted across process restarts.
#[derive(Debug, Clone)]
pub struct McpSession {
    pub server_name: String,
    pub session_id: String,
    pub source: SessionIdSource,
    pub established_at: chrono::DateTime<chrono::Utc>,
    pub is_webcrawl_variant: bool,
    /// Set when every handshake format in the alternate-session retry
    /// ladder failed and discovery fell back to the unauthenticated
    /// `GET {baseUrl}/mcp/tools` path. A session in this mode has no
    /// usable session id — tool invocation against it always fails.
    pub unauthenticated_discovery_only: bool,
    /// Shared (not per-clone) so every `tools/list`/`tools/call` issued
    /// against this session — even across separate calls that each
    /// re-fetch a cloned `McpSession` from the registry's session cache —
    /// draws from the same monotonic counter.
    next_request_id: Arc<AtomicU64>,
}

impl McpSession {
    /// Next JSON-RPC request id for this session: a monotonic counter
    /// scoped to the session, shared across clones of this `McpSession`.
    pub fn next_id(&self) -> String {
        let n = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.server_name, n)
    }

    /// Attaches the session header(s) to an outgoing request, duplicating
    /// across all three header names when this server needs the
    /// webcrawl-variant quirk.
    pub fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req.header(HEADER_MCP_SESSION_ID, &self.session_id);
        if self.is_webcrawl_variant {
            req = req
                .header(HEADER_X_MCP_SESSION_ID, &self.session_id)
                .header(HEADER_SESSION_ID, &self.session_id);
        }
        req
    }
}

/// The three session-id formats the alternate-session retry ladder
/// cycles through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIdFormat {
    EpochMillis,
    RandomUuid,
    ServerSpecific,
}

fn synth_session_id(format: SessionIdFormat, server_name: &str, webcrawl: bool) -> String {
    match format {
        SessionIdFormat::EpochMillis => {
            format!("session_{}", chrono::Utc::now().timestamp_millis())
        }
        SessionIdFormat::RandomUuid if webcrawl => format!("webcrawl-{}", Uuid::new_v4()),
        SessionIdFormat::RandomUuid => Uuid::new_v4().to_string(),
        SessionIdFormat::ServerSpecific => format!("{server_name}-session"),
    }
}

/// Low-level JSON-RPC transport: owns the HTTP client and knows how to
/// run the handshake, but not what tools exist or how to dispatch them
/// (that's [`super::client::McpClient`]).
pub struct HandshakeTransport {
    http: reqwest::Client,
    base_url: String,
    auth_cache: Arc<TokenCache>,
    auth_config: AuthConfig,
    server_name: String,
}

impl HandshakeTransport {
    pub fn new(
        base_url: impl Into<String>,
        auth_cache: Arc<TokenCache>,
        auth_config: AuthConfig,
        server_name: impl Into<String>,
    ) -> Result<Self, McpError> {
        Self::with_timeouts(
            base_url,
            auth_cache,
            auth_config,
            server_name,
            McpTimeouts::default(),
        )
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        auth_cache: Arc<TokenCache>,
        auth_config: AuthConfig,
        server_name: impl Into<String>,
        timeouts: McpTimeouts,
    ) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.read_write)
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            auth_cache,
            auth_config,
            server_name: server_name.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/mcp", self.base_url.trim_end_matches('/'))
    }

    /// Builds a request carrying a freshly-resolved credential — never a
    /// credential frozen at connection time, so an OAuth2 token refreshed
    /// mid-session is picked up on the very next call.
    async fn request_builder(&self, body: Value) -> Result<reqwest::RequestBuilder, McpError> {
        let mut req = self
            .http
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .json(&body);
        if let Some(resolved) = self
            .auth_cache
            .token_for(&self.auth_config, &self.server_name)
            .await?
        {
            req = req.header(resolved.header_name, resolved.header_value);
        }
        Ok(req)
    }

    /// Same as [`Self::request_builder`] but exposed for callers outside
    /// this module (tool discovery and invocation) that need the same
    /// freshly-authenticated POST builder.
    pub async fn authed_request(&self, body: Value) -> Result<reqwest::RequestBuilder, McpError> {
        self.request_builder(body).await
    }

    /// Runs `initialize` → extract session id → `notifications/initialized`,
    /// optionally forcing a specific session-id format for the
    /// alternate-session retry ladder.
    pub async fn handshake(
        &self,
        server_name: &str,
        webcrawl_variant: bool,
        forced_format: Option<SessionIdFormat>,
    ) -> Result<McpSession, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": true}, "resources": {"listChanged": true}},
            "clientInfo": {"name": "agentcore", "version": env!("CARGO_PKG_VERSION")},
        });
        let body = json!({"jsonrpc": "2.0", "method": "initialize", "id": "init-1", "params": params});

        let resp = self
            .request_builder(body)
            .await?
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "initialize returned HTTP {}",
                resp.status()
            )));
        }

        let header_session_id = resp
            .headers()
            .get(HEADER_MCP_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = resp
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        let (session_id, source) = if let Some(forced) = forced_format {
            (
                synth_session_id(forced, server_name, webcrawl_variant),
                SessionIdSource::Failsafe,
            )
        } else if let Some(id) = header_session_id {
            (id, SessionIdSource::Header)
        } else if let Some(id) = parsed
            .get("result")
            .and_then(|r| r.get("sessionId"))
            .and_then(Value::as_str)
        {
            (id.to_string(), SessionIdSource::Body)
        } else if let Some(id) = parsed
            .get("result")
            .and_then(|r| r.get("serverInfo"))
            .and_then(|si| si.get("sessionId"))
            .and_then(Value::as_str)
        {
            (id.to_string(), SessionIdSource::Body)
        } else {
            (
                format!("session_{}", chrono::Utc::now().timestamp_millis()),
                SessionIdSource::Failsafe,
            )
        };

        let webcrawl = webcrawl_variant || server_name.to_ascii_lowercase().contains("webcrawl");
        let session = McpSession {
            server_name: server_name.to_string(),
            session_id,
            source,
            established_at: chrono::Utc::now(),
            is_webcrawl_variant: webcrawl,
            unauthenticated_discovery_only: false,
            next_request_id: Arc::new(AtomicU64::new(1)),
        };

        // Best-effort: a failure here is logged, not fatal.
        let notify_body = json!({"jsonrpc": "2.0", "method": "notifications/initialized", "params": {}});
        match self.request_builder(notify_body).await {
            Ok(builder) => {
                if let Err(e) = session.apply_headers(builder).send().await {
                    tracing::warn!(server = server_name, error = %e, "notifications/initialized failed");
                }
            }
            Err(e) => {
                tracing::warn!(server = server_name, error = %e, "notifications/initialized failed");
            }
        }

        Ok(session)
    }

    /// Validates a session with a lightweight `tools/list`, running the
    /// alternate-session retry ladder (N=3 different id formats) if the
    /// server reports the session is invalid.
    pub async fn establish_validated(
        &self,
        server_name: &str,
        webcrawl_variant: bool,
    ) -> Result<McpSession, McpError> {
        let mut session = self.handshake(server_name, webcrawl_variant, None).await?;
        if self.probe_session(&session).await.is_ok() {
            return Ok(session);
        }

        for format in [
            SessionIdFormat::EpochMillis,
            SessionIdFormat::RandomUuid,
            SessionIdFormat::ServerSpecific,
        ] {
            session = self
                .handshake(server_name, webcrawl_variant, Some(format))
                .await?;
            if self.probe_session(&session).await.is_ok() {
                return Ok(session);
            }
        }

        if self.server_advertises_unauthenticated_tools().await {
            tracing::warn!(
                server = server_name,
                "all handshake formats rejected, falling back to unauthenticated tools endpoint"
            );
            return Ok(McpSession {
                server_name: server_name.to_string(),
                session_id: String::new(),
                source: SessionIdSource::Failsafe,
                established_at: chrono::Utc::now(),
                is_webcrawl_variant: webcrawl_variant,
                unauthenticated_discovery_only: true,
                next_request_id: Arc::new(AtomicU64::new(1)),
            });
        }

        Err(McpError::Unavailable(server_name.to_string()))
    }

    /// Probes whether the server exposes the unauthenticated fallback
    /// discovery endpoint (`GET {baseUrl}/mcp/tools`) without attaching
    /// any session header or credential.
    async fn server_advertises_unauthenticated_tools(&self) -> bool {
        self.http
            .get(self.unauthenticated_tools_endpoint())
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    fn unauthenticated_tools_endpoint(&self) -> String {
        format!("{}/mcp/tools", self.base_url.trim_end_matches('/'))
    }

    /// Fetches the tool list from the unauthenticated fallback endpoint.
    /// Accepts either a bare JSON array or `{"tools": [...]}`. Idempotent
    /// GETs get one local retry on transport failure per the error-handling
    /// policy, rather than surfacing the first transient failure.
    pub async fn fetch_tools_unauthenticated(&self) -> Result<Value, McpError> {
        match self.get_unauthenticated_tools_once().await {
            Ok(v) => Ok(v),
            Err(McpError::Transport(_)) => self.get_unauthenticated_tools_once().await,
            Err(e) => Err(e),
        }
    }

    async fn get_unauthenticated_tools_once(&self) -> Result<Value, McpError> {
        let resp = self
            .http
            .get(self.unauthenticated_tools_endpoint())
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "GET /mcp/tools returned HTTP {}",
                resp.status()
            )));
        }
        resp.json().await.map_err(|e| McpError::Protocol(e.to_string()))
    }

    async fn probe_session(&self, session: &McpSession) -> Result<(), McpError> {
        let body = json!({"jsonrpc": "2.0", "method": "tools/list", "id": session.next_id(), "params": {}});
        let resp = session
            .apply_headers(self.request_builder(body).await?)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Protocol(format!("HTTP {}", resp.status())));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if let Some(err) = parsed.get("error") {
            return Err(McpError::Protocol(
                err.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("invalid session")
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webcrawl_random_uuid_uses_webcrawl_prefix() {
        let id = synth_session_id(SessionIdFormat::RandomUuid, "webcrawl-1", true);
        assert!(id.starts_with("webcrawl-"));
    }

    #[test]
    fn non_webcrawl_random_uuid_has_no_prefix() {
        let id = synth_session_id(SessionIdFormat::RandomUuid, "search", false);
        assert!(!id.starts_with("webcrawl-"));
    }

    #[test]
    fn server_specific_format_embeds_server_name() {
        let id = synth_session_id(SessionIdFormat::ServerSpecific, "search", false);
        assert_eq!(id, "search-session");
    }
}
