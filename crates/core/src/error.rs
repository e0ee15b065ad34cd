//! Error taxonomy for the conversation engine.
//!
//! Leaf errors (`AuthError`, `McpError`, `LlmError`, `FilterError`,
//! `StoreError`) are defined next to the component that raises them and
//! folded into [`AgentError`], which is what the orchestrator and the
//! facade actually see. `anyhow` takes over at the binary boundary.

use std::fmt;

/// Top-level error surfaced by the orchestrator to its caller.
///
/// Per-stream errors are never propagated as exceptions to the client;
/// the facade is responsible for converting every variant here into a
/// terminal NDJSON `{"error": "..."}` object (or, for `Validation`/
/// `NotFound`, an HTTP status before the stream even starts).
#[derive(Debug)]
pub enum AgentError {
    /// User input empty or malformed.
    Validation(String),
    /// Unknown chat or task id.
    NotFound(String),
    /// Network, timeout, or TLS failure.
    Transport(String),
    /// Malformed JSON-RPC / SSE, or an MCP protocol-level error.
    Protocol(String),
    /// Token acquisition failed; request abandoned.
    AuthUnavailable,
    /// A tool call returned `isError`. Not fatal on its own — callers
    /// feed this back to the LLM as a `tool` message.
    ToolFailure { name: String, message: String },
    /// Filtered content exceeded the configured size bound.
    ContentTooLong,
    /// The raw stream was non-empty but nothing survived filtering.
    EmptyAfterFilter,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Validation(msg) => write!(f, "validation error: {msg}"),
            AgentError::NotFound(what) => write!(f, "not found: {what}"),
            AgentError::Transport(msg) => write!(f, "transport error: {msg}"),
            AgentError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            AgentError::AuthUnavailable => write!(f, "authentication unavailable"),
            AgentError::ToolFailure { name, message } => {
                write!(f, "tool `{name}` failed: {message}")
            }
            AgentError::ContentTooLong => write!(f, "content exceeded the maximum length"),
            AgentError::EmptyAfterFilter => write!(
                f,
                "AI response was empty after filtering tool-related content."
            ),
        }
    }
}

impl std::error::Error for AgentError {}

/// JSON error object emitted as the last NDJSON line of a stream.
pub fn to_stream_error_json(err: &AgentError) -> serde_json::Value {
    serde_json::json!({ "error": err.to_string() })
}

impl From<crate::mcp::McpError> for AgentError {
    fn from(err: crate::mcp::McpError) -> Self {
        match err {
            crate::mcp::McpError::Transport(msg) => AgentError::Transport(msg),
            crate::mcp::McpError::Protocol(msg) => AgentError::Protocol(msg),
            crate::mcp::McpError::Unavailable(name) => {
                AgentError::Transport(format!("server `{name}` is unavailable"))
            }
            crate::mcp::McpError::UnknownTool(name) => {
                AgentError::Validation(format!("unknown tool `{name}`"))
            }
            crate::mcp::McpError::AuthUnavailable => AgentError::AuthUnavailable,
        }
    }
}

impl From<crate::llm::LlmError> for AgentError {
    fn from(err: crate::llm::LlmError) -> Self {
        match err {
            crate::llm::LlmError::Http(msg) => AgentError::Transport(msg),
            crate::llm::LlmError::Json(msg) => AgentError::Protocol(msg),
            crate::llm::LlmError::Stream(msg) => AgentError::Protocol(msg),
        }
    }
}

impl From<crate::filter::FilterError> for AgentError {
    fn from(_: crate::filter::FilterError) -> Self {
        AgentError::ContentTooLong
    }
}

impl From<crate::store::StoreError> for AgentError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::NotFound(id) => AgentError::NotFound(id),
            crate::store::StoreError::Backend(msg) => AgentError::Transport(msg),
        }
    }
}
