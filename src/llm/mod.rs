//! LLM provider clients and abstractions.
//!
//! One normalized request/response/event vocabulary over two wire dialects:
//! OpenAI-style Chat Completions and Gemini-native `generateContent` (with
//! thought signatures). Providers are configured by name; models route to a
//! provider and carry capability flags.

/// Client trait, normalized request/reply/event types, stream assembly.
pub mod client;
/// Gemini-native dialect.
pub mod gemini;
/// OpenAI-style Chat Completions dialect.
pub mod openai;
/// Named provider/model routing.
pub mod provider_registry;

pub use client::{
    CompletionReply, CompletionRequest, FinishReason, LLMClient, StreamAssembler, StreamEvent,
    ToolChoice,
};
pub use provider_registry::{LLMClientFactoryTrait, ProviderRegistry};
