//! Mock implementations for testing.
//!
//! This module provides a scripted LLM client and factory usable across
//! test files without duplication. The client replays a queue of replies;
//! `stream` renders each reply as the normalized event sequence a real
//! dialect would produce (text deltas, chunked tool-call arguments, thought
//! tokens, finish).

use async_trait::async_trait;
use orca::llm::provider_registry::LLMClientFactoryTrait;
use orca::llm::{
    CompletionReply, CompletionRequest, FinishReason, LLMClient, StreamEvent,
};
use orca::types::{AppError, Result, ToolCall};
use orca::utils::config::ModelConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Scripted LLM client: returns queued replies in order.
pub struct MockLLMClient {
    replies: Mutex<VecDeque<CompletionReply>>,
    /// Requests seen, for assertions on history construction.
    pub requests: Mutex<Vec<CompletionRequest>>,
    fail: bool,
}

impl MockLLMClient {
    pub fn scripted(replies: Vec<CompletionReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// A client whose every call fails, for provider-error paths.
    pub fn failing() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn next_reply(&self) -> Result<CompletionReply> {
        if self.fail {
            return Err(AppError::Provider("mock provider failure".to_string()));
        }
        Ok(self.replies.lock().pop_front().unwrap_or_else(|| text_reply("")))
    }
}

#[async_trait]
impl LLMClient for MockLLMClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionReply> {
        self.requests.lock().push(request.clone());
        self.next_reply()
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = Result<StreamEvent>> + Send>>> {
        self.requests.lock().push(request.clone());
        let reply = self.next_reply()?;
        let mut events: Vec<Result<StreamEvent>> = Vec::new();
        // Split the text in two to exercise delta handling
        if !reply.content.is_empty() {
            let mid = reply.content.len() / 2;
            let mid = (0..=mid)
                .rev()
                .find(|i| reply.content.is_char_boundary(*i))
                .unwrap_or(0);
            let (a, b) = reply.content.split_at(mid);
            if !a.is_empty() {
                events.push(Ok(StreamEvent::TextDelta(a.to_string())));
            }
            if !b.is_empty() {
                events.push(Ok(StreamEvent::TextDelta(b.to_string())));
            }
        }
        for (index, call) in reply.tool_calls.iter().enumerate() {
            if let Some(signature) = &call.thought_signature {
                events.push(Ok(StreamEvent::Thought(signature.clone())));
            }
            // Arguments arrive in two chunks, as real providers stream them
            let mid = call.arguments.len() / 2;
            let mid = (0..=mid)
                .rev()
                .find(|i| call.arguments.is_char_boundary(*i))
                .unwrap_or(0);
            let (a, b) = call.arguments.split_at(mid);
            events.push(Ok(StreamEvent::ToolCallDelta {
                index,
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments_chunk: a.to_string(),
            }));
            if !b.is_empty() {
                events.push(Ok(StreamEvent::ToolCallDelta {
                    index,
                    id: None,
                    name: None,
                    arguments_chunk: b.to_string(),
                }));
            }
        }
        events.push(Ok(StreamEvent::Finish(reply.finish_reason)));
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

/// Factory handing out one shared scripted client.
pub struct MockFactory {
    client: Arc<MockLLMClient>,
    supports_tools: bool,
}

impl MockFactory {
    pub fn new(client: Arc<MockLLMClient>) -> Self {
        Self {
            client,
            supports_tools: true,
        }
    }

    pub fn without_tools(client: Arc<MockLLMClient>) -> Self {
        Self {
            client,
            supports_tools: false,
        }
    }
}

impl LLMClientFactoryTrait for MockFactory {
    fn create_client(&self, _model_name: &str) -> Result<Arc<dyn LLMClient>> {
        Ok(self.client.clone())
    }

    fn supports_tools(&self, _model_name: &str) -> bool {
        self.supports_tools
    }

    fn model_config(&self, _model_name: &str) -> Option<&ModelConfig> {
        None
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }
}

/// A plain-text reply.
pub fn text_reply(content: &str) -> CompletionReply {
    CompletionReply {
        content: content.to_string(),
        tool_calls: vec![],
        finish_reason: FinishReason::Stop,
    }
}

/// A reply carrying one tool call with the given raw arguments.
pub fn tool_reply(id: &str, name: &str, arguments: &str) -> CompletionReply {
    CompletionReply {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
            thought_signature: None,
        }],
        finish_reason: FinishReason::ToolCalls,
    }
}
