//! Model Context Protocol integration: handshake, tool discovery, and
//! tool execution against externally configured MCP servers.

pub mod client;
pub mod config;
pub mod registry;
pub mod session;

pub use client::{McpClient, ToolDescriptor, ToolResult};
pub use config::{McpServerConfig, RawAuthConfig};
pub use registry::{IntegrationRegistry, RegistrySnapshot, ToolSelection};
pub use session::McpTimeouts;

#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server `{0}` is unavailable")]
    Unavailable(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("authentication unavailable")]
    AuthUnavailable,
}

impl From<crate::auth::AuthError> for McpError {
    fn from(_: crate::auth::AuthError) -> Self {
        McpError::AuthUnavailable
    }
}
