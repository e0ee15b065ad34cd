//! OpenAI-compatible chat-completions client (C6).

pub mod client;

pub use client::{Delta, LlmClient, LlmError};
