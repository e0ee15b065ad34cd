//! Streaming tool-augmented conversation engine.
//!
//! Ties together MCP-backed tool discovery and execution, an
//! OpenAI-compatible streaming LLM client, and content filtering into a
//! single per-chat assistant turn ([`orchestrator::Orchestrator`]).

pub mod auth;
pub mod chat;
pub mod error;
pub mod filter;
pub mod llm;
pub mod mcp;
pub mod orchestrator;
pub mod store;

pub use error::AgentError;
pub use orchestrator::Orchestrator;
