//! LLM client abstractions.
//!
//! All providers implement [`LLMClient`]: a non-streaming `complete` and a
//! streaming `stream` returning normalized [`StreamEvent`]s. The
//! [`StreamAssembler`] folds an event stream back into an aggregated reply —
//! tool-call argument chunks are reassembled by index and completed calls
//! only materialize at `Finish`.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::types::{AppError, Message, Result, ToolCall, ToolDefinition};

/// Normalized completion request shared by all dialects.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Provider-side model identifier.
    pub model: String,
    /// Message log, oldest first. `role=system` entries become the dialect's
    /// system slot.
    pub messages: Vec<Message>,
    /// Tool declarations. Empty disables tool calling for this request.
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice policy.
    pub tool_choice: ToolChoice,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Completion token cap.
    pub max_tokens: Option<u32>,
}

/// Tool-choice policy for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// The model decides whether to call tools.
    #[default]
    Auto,
    /// Tool calling disabled for this request.
    None,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural completion.
    Stop,
    /// The model issued tool calls.
    ToolCalls,
    /// Token limit reached.
    Length,
    /// Provider-reported error state.
    Error,
}

/// Normalized streaming event.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk of assistant text.
    TextDelta(String),
    /// A chunk of a tool call. `id` and `name` arrive on the first chunk for
    /// an index; `arguments_chunk` fragments are concatenated in order.
    ToolCallDelta {
        /// Position of the call within the reply.
        index: usize,
        /// Provider-assigned call id (first chunk only).
        id: Option<String>,
        /// Tool name (first chunk only).
        name: Option<String>,
        /// Fragment of the raw argument string.
        arguments_chunk: String,
    },
    /// Opaque provider reasoning token. Attaches to the next tool call seen.
    Thought(String),
    /// Terminal event.
    Finish(FinishReason),
}

/// Aggregated (non-streaming) reply.
#[derive(Debug, Clone)]
pub struct CompletionReply {
    /// Assistant text, possibly empty for pure tool-call replies.
    pub content: String,
    /// Completed tool calls in reply order.
    pub tool_calls: Vec<ToolCall>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

/// Boxed stream of normalized events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Generic LLM client trait for provider abstraction.
///
/// Implementations are `Send + Sync` and hold no per-conversation state
/// beyond in-flight HTTP transactions, so one instance may serve concurrent
/// turns.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Single aggregated completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionReply>;

    /// Streaming completion as normalized events.
    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream>;

    /// The model identifier this client targets.
    fn model_name(&self) -> &str;
}

// ============= Stream assembly =============

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
    thought_signature: Option<String>,
}

/// Reassembles a normalized event stream into a [`CompletionReply`].
///
/// Partial argument strings are keyed by call index; a completed call is
/// only produced once the stream finishes, which is the contract streaming
/// consumers rely on (a half-received call is never dispatched).
#[derive(Debug, Default)]
pub struct StreamAssembler {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
    pending_signature: Option<String>,
    finish: Option<FinishReason>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the assembly state.
    pub fn ingest(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => self.content.push_str(text),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_chunk,
            } => {
                let is_new = !self.calls.contains_key(index);
                let call = self.calls.entry(*index).or_default();
                if let Some(id) = id {
                    call.id = Some(id.clone());
                }
                if let Some(name) = name {
                    call.name.push_str(name);
                }
                call.arguments.push_str(arguments_chunk);
                if is_new {
                    call.thought_signature = self.pending_signature.take();
                }
            }
            StreamEvent::Thought(signature) => {
                self.pending_signature = Some(signature.clone());
            }
            StreamEvent::Finish(reason) => self.finish = Some(*reason),
        }
    }

    /// Finish assembly. Errors when the stream ended without a terminal
    /// event, which indicates a truncated provider response.
    pub fn finish(self) -> Result<CompletionReply> {
        let finish_reason = self.finish.ok_or_else(|| {
            AppError::ProviderProtocol("Stream ended without a finish event".to_string())
        })?;
        let tool_calls = self
            .calls
            .into_iter()
            .map(|(index, call)| ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                name: call.name,
                arguments: call.arguments,
                thought_signature: call.thought_signature,
            })
            .collect();
        Ok(CompletionReply {
            content: self.content,
            tool_calls,
            finish_reason,
        })
    }
}

// ============= Shared HTTP plumbing =============

/// Transient-failure retry bound for provider calls.
const MAX_ATTEMPTS: u32 = 3;

/// POST a JSON body, retrying transient failures (network errors and 5xx)
/// with exponential backoff. 4xx responses surface immediately with the
/// provider's error text. Generic over the body so dialects that must
/// preserve raw byte sequences (`RawValue` parts) are serialized exactly
/// once, straight onto the wire.
pub(crate) async fn post_json_with_retry<B>(
    http: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: &B,
) -> Result<reqwest::Response>
where
    B: serde::Serialize + ?Sized,
{
    let mut last_error = String::new();
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_millis(250 * 2u64.pow(attempt - 1));
            tokio::time::sleep(backoff).await;
        }
        let mut request = http.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let text = response.text().await.unwrap_or_default();
                if status.is_client_error() {
                    return Err(AppError::Provider(format!("HTTP {}: {}", status, text)));
                }
                last_error = format!("HTTP {}: {}", status, text);
                tracing::warn!(attempt, %status, "Provider call failed, retrying");
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(attempt, error = %e, "Provider call failed, retrying");
            }
        }
    }
    Err(AppError::Provider(format!(
        "Provider unreachable after {} attempts: {}",
        MAX_ATTEMPTS, last_error
    )))
}
