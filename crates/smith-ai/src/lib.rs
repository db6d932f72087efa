//! Reasoning-engine boundary: chat message model, the `LlmClient` trait, and
//! an OpenAI-compatible chat-completions client with bounded retry.

mod openai;
mod retry;
mod types;

pub use openai::{OpenAiClient, OpenAiConfig};
pub use retry::{next_backoff_ms, parse_retry_after_ms, should_retry_status};
pub use types::{
    AiError, ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message, MessageRole,
    ToolCall, ToolDefinition,
};
