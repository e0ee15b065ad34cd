//! MCP operations: tool discovery and invocation (C2).
//!
//! Built directly on [`HandshakeTransport`] rather than a third-party MCP
//! SDK — the session-id extraction order, webcrawl header quirk, and
//! retry ladder are protocol-level details this system needs to control
//! directly, the way loom's `McpHttpSession` hand-rolls its JSON-RPC POST
//! instead of delegating to one.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::auth::TokenCache;

use super::config::McpServerConfig;
use super::session::{HandshakeTransport, McpSession, McpTimeouts};
use super::McpError;

/// A tool advertised by an MCP server's `tools/list` response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

/// One configured MCP server: its transport plus whatever session is
/// currently established (if any).
pub struct McpClient {
    pub config: McpServerConfig,
    transport: HandshakeTransport,
}

impl McpClient {
    pub fn new(config: McpServerConfig, auth_cache: Arc<TokenCache>) -> Result<Self, McpError> {
        Self::with_timeouts(config, auth_cache, McpTimeouts::default())
    }

    pub fn with_timeouts(
        config: McpServerConfig,
        auth_cache: Arc<TokenCache>,
        timeouts: McpTimeouts,
    ) -> Result<Self, McpError> {
        let auth_config = config.auth_config();
        let server_name = config.name.clone();
        let transport = HandshakeTransport::with_timeouts(
            config.base_url.clone(),
            auth_cache,
            auth_config,
            server_name,
            timeouts,
        )?;
        Ok(Self { config, transport })
    }

    pub async fn establish_session(&self) -> Result<McpSession, McpError> {
        self.transport
            .establish_validated(&self.config.name, self.config.webcrawl_variant())
            .await
    }

    pub async fn discover_tools(
        &self,
        session: &McpSession,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        if session.unauthenticated_discovery_only {
            let body = self.transport.fetch_tools_unauthenticated().await?;
            let tools = match &body {
                Value::Array(_) => body,
                Value::Object(obj) => obj.get("tools").cloned().unwrap_or(Value::Array(vec![])),
                _ => Value::Array(vec![]),
            };
            return serde_json::from_value(tools).map_err(|e| McpError::Protocol(e.to_string()));
        }

        let body = json!({"jsonrpc": "2.0", "method": "tools/list", "id": session.next_id(), "params": {}});
        let resp = session
            .apply_headers(self.transport.authed_request(body).await?)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "tools/list returned HTTP {}",
                resp.status()
            )));
        }

        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?;

        if let Some(err) = parsed.get("error") {
            return Err(McpError::Protocol(
                err.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("tools/list failed")
                    .to_string(),
            ));
        }

        let tools = parsed
            .get("result")
            .and_then(|r| r.get("tools"))
            .cloned()
            .unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools).map_err(|e| McpError::Protocol(e.to_string()))
    }

    /// Invokes `name` with `arguments` (already-serialized JSON), mapping
    /// every failure mode (HTTP 4xx/5xx, JSON-RPC error, 304 cached
    /// success) onto a [`ToolResult`] rather than propagating them —
    /// callers feed `is_error` results back to the LLM as tool messages.
    pub async fn invoke_tool(
        &self,
        session: &McpSession,
        name: &str,
        arguments: Value,
    ) -> Result<ToolResult, McpError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "id": session.next_id(),
            "params": {"name": name, "arguments": arguments},
        });

        let resp = session
            .apply_headers(self.transport.authed_request(body).await?)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let status = resp.status();

        if status == reqwest::StatusCode::NOT_MODIFIED {
            let text = resp.text().await.unwrap_or_default();
            if text.trim().is_empty() {
                return Ok(ToolResult {
                    content: "<cached>".to_string(),
                    is_error: false,
                });
            }
            return parse_tool_call_body(&text);
        }

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Ok(ToolResult {
                content: if text.is_empty() {
                    format!("tool call failed with HTTP {status}")
                } else {
                    text
                },
                is_error: true,
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        parse_tool_call_body(&text)
    }
}

fn parse_tool_call_body(text: &str) -> Result<ToolResult, McpError> {
    let parsed: Value = serde_json::from_str(text).map_err(|e| McpError::Protocol(e.to_string()))?;

    if let Some(err) = parsed.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("tool call failed")
            .to_string();
        return Ok(ToolResult {
            content: message,
            is_error: true,
        });
    }

    let content_parts = parsed
        .get("result")
        .and_then(|r| r.get("content"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let joined = content_parts
        .iter()
        .filter_map(|part| match part.get("type").and_then(Value::as_str) {
            Some("text") => part.get("text").and_then(Value::as_str).map(str::to_string),
            Some("image") | Some("resource") => part
                .get("data")
                .and_then(Value::as_str)
                .or_else(|| part.get("blob").and_then(Value::as_str))
                .map(str::to_string),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let is_error = parsed
        .get("result")
        .and_then(|r| r.get("isError"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(ToolResult {
        content: joined,
        is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_content_parts() {
        let body = r#"{"jsonrpc":"2.0","id":"call-x","result":{"content":[{"type":"text","text":"hello"},{"type":"text","text":"world"}],"isError":false}}"#;
        let result = parse_tool_call_body(body).unwrap();
        assert_eq!(result.content, "hello\nworld");
        assert!(!result.is_error);
    }

    #[test]
    fn json_rpc_error_becomes_error_result() {
        let body = r#"{"jsonrpc":"2.0","id":"call-x","error":{"code":-32001,"message":"Invalid Session"}}"#;
        let result = parse_tool_call_body(body).unwrap();
        assert!(result.is_error);
        assert_eq!(result.content, "Invalid Session");
    }

    #[test]
    fn result_level_is_error_flag_is_respected() {
        let body = r#"{"jsonrpc":"2.0","id":"call-x","result":{"content":[{"type":"text","text":"boom"}],"isError":true}}"#;
        let result = parse_tool_call_body(body).unwrap();
        assert!(result.is_error);
        assert_eq!(result.content, "boom");
    }
}
