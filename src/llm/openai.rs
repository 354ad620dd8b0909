//! OpenAI-style Chat Completions dialect.
//!
//! The normalized request maps essentially 1:1 onto this wire format. Tool
//! calls come back as `{id, type: "function", function: {name, arguments}}`
//! with `arguments` as a JSON string; when streaming, argument fragments are
//! keyed by `index` and the normalized events carry them through for the
//! assembler to reassemble.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::llm::client::{
    post_json_with_retry, CompletionReply, CompletionRequest, EventStream, FinishReason,
    LLMClient, StreamEvent, ToolChoice,
};
use crate::types::{AppError, Message, MessageRole, Result, ToolCall, ToolDefinition};

/// Chat Completions client for OpenAI and compatible endpoints.
pub struct OpenAIClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl OpenAIClient {
    /// Create a client against an API base (e.g. `https://api.openai.com/v1`).
    pub fn new(http: reqwest::Client, api_key: String, api_base: String, model: String) -> Self {
        Self {
            http,
            api_key,
            api_base,
            model,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {}", self.api_key))]
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Result<serde_json::Value> {
        let messages: Vec<WireMessage> = request.messages.iter().map(convert_message).collect();
        let tools: Option<Vec<WireTool>> = if request.tools.is_empty()
            || request.tool_choice == ToolChoice::None
        {
            None
        } else {
            Some(request.tools.iter().map(convert_tool).collect())
        };
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            tools,
            temperature: request.temperature,
            max_completion_tokens: request.max_tokens,
            stream,
        };
        serde_json::to_value(&body)
            .map_err(|e| AppError::Internal(format!("Failed to serialize request: {}", e)))
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionReply> {
        let body = self.build_body(request, false)?;
        let response = post_json_with_retry(&self.http, &self.endpoint(), &self.headers(), &body)
            .await?
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| AppError::ProviderProtocol(format!("Malformed completion: {}", e)))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::ProviderProtocol("Completion had no choices".to_string()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
                thought_signature: None,
            })
            .collect();

        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            map_finish_reason(choice.finish_reason.as_deref())
        };

        Ok(CompletionReply {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream> {
        let body = self.build_body(request, true)?;
        let response =
            post_json_with_retry(&self.http, &self.endpoint(), &self.headers(), &body).await?;

        let mut events = Box::pin(response.bytes_stream().eventsource());
        let stream = async_stream::stream! {
            let mut finished = false;
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(AppError::Provider(format!("Stream error: {}", e)));
                        return;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(AppError::ProviderProtocol(format!(
                            "Malformed stream chunk: {}",
                            e
                        )));
                        return;
                    }
                };
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield Ok(StreamEvent::TextDelta(content));
                        }
                    }
                    for delta in choice.delta.tool_calls.unwrap_or_default() {
                        yield Ok(StreamEvent::ToolCallDelta {
                            index: delta.index,
                            id: delta.id,
                            name: delta.function.as_ref().and_then(|f| f.name.clone()),
                            arguments_chunk: delta
                                .function
                                .as_ref()
                                .and_then(|f| f.arguments.clone())
                                .unwrap_or_default(),
                        });
                    }
                    if let Some(reason) = choice.finish_reason {
                        finished = true;
                        yield Ok(StreamEvent::Finish(map_finish_reason(Some(&reason))));
                    }
                }
                if finished {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") | None => FinishReason::Stop,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        Some(_) => FinishReason::Error,
    }
}

fn convert_message(message: &Message) -> WireMessage {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
        )
    };
    WireMessage {
        role: role.to_string(),
        content: if message.content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(message.content.clone())
        },
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn convert_tool(tool: &ToolDefinition) -> WireTool {
    WireTool {
        tool_type: "function".to_string(),
        function: WireFunction {
            name: tool.name.clone(),
            description: Some(tool.description.clone()),
            parameters: tool.parameters.clone(),
        },
    }
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
