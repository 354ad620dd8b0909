//! Gemini-native `generateContent` dialect.
//!
//! Requests use `contents[]` of `parts[]` carrying text, `functionCall`, or
//! `functionResponse`. A model turn that issues a tool call returns the
//! `functionCall` together with an opaque `thoughtSignature`; the follow-up
//! request that supplies the `functionResponse` must carry that original
//! part back unchanged — renamed or regenerated parts are rejected by the
//! provider. The client therefore caches the raw part text by call id and
//! re-emits it verbatim (`RawValue`, byte-for-byte); calls restored from
//! persisted history without a cache entry are reconstructed from the stored
//! name, arguments, and signature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::llm::client::{
    post_json_with_retry, CompletionReply, CompletionRequest, EventStream, FinishReason,
    LLMClient, StreamEvent, ToolChoice,
};
use crate::types::{AppError, MessageRole, Result, ToolCall, ToolDefinition};

#[derive(Debug, Clone)]
struct CallMeta {
    /// Exact JSON text of the model-produced part, re-emitted verbatim.
    raw_part: String,
}

/// Gemini-native client.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    call_meta: Arc<Mutex<HashMap<String, CallMeta>>>,
    call_counter: Arc<AtomicU64>,
}

impl GeminiClient {
    /// Create a client against an API base
    /// (e.g. `https://generativelanguage.googleapis.com/v1beta`).
    pub fn new(http: reqwest::Client, api_key: String, api_base: String, model: String) -> Self {
        Self {
            http,
            api_key,
            api_base,
            model,
            call_meta: Arc::new(Mutex::new(HashMap::new())),
            call_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.api_base.trim_end_matches('/'),
            self.model,
            method
        )
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![("x-goog-api-key", self.api_key.clone())]
    }

    fn next_call_id(counter: &AtomicU64) -> String {
        format!("gemini_call_{}", counter.fetch_add(1, Ordering::SeqCst))
    }

    fn build_body(&self, request: &CompletionRequest) -> Result<GenerateContentRequest> {
        let mut contents: Vec<GeminiContentOut> = Vec::new();
        let mut system_instruction: Option<GeminiContentOut> = None;

        for message in &request.messages {
            match message.role {
                MessageRole::System => {
                    if system_instruction.is_none() {
                        system_instruction = Some(GeminiContentOut {
                            role: None,
                            parts: vec![raw_part(&serde_json::json!({"text": message.content}))?],
                        });
                    }
                }
                MessageRole::User => {
                    contents.push(GeminiContentOut {
                        role: Some("user".to_string()),
                        parts: vec![raw_part(&serde_json::json!({"text": message.content}))?],
                    });
                }
                MessageRole::Assistant => {
                    let mut parts = Vec::new();
                    if !message.content.is_empty() {
                        parts.push(raw_part(&serde_json::json!({"text": message.content}))?);
                    }
                    for call in &message.tool_calls {
                        parts.push(self.function_call_part(call)?);
                    }
                    if !parts.is_empty() {
                        contents.push(GeminiContentOut {
                            role: Some("model".to_string()),
                            parts,
                        });
                    }
                }
                MessageRole::Tool => {
                    // Name preserved byte-for-byte, including any `ns:` prefix.
                    let name = message.name.clone().unwrap_or_else(|| "tool".to_string());
                    let response = serde_json::from_str::<serde_json::Value>(&message.content)
                        .unwrap_or_else(|_| serde_json::json!({"result": message.content}));
                    contents.push(GeminiContentOut {
                        role: Some("user".to_string()),
                        parts: vec![raw_part(&serde_json::json!({
                            "functionResponse": {"name": name, "response": response}
                        }))?],
                    });
                }
            }
        }

        let tools = if request.tools.is_empty() || request.tool_choice == ToolChoice::None {
            None
        } else {
            Some(vec![GeminiTool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t: &ToolDefinition| GeminiFunctionDeclaration {
                        name: t.name.clone(),
                        description: Some(t.description.clone()),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }])
        };

        Ok(GenerateContentRequest {
            contents,
            tools,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            }),
        })
    }

    /// The `functionCall` part for a previously issued call: the cached raw
    /// part when this client produced it, otherwise a reconstruction from
    /// the persisted call (cross-restart path).
    fn function_call_part(&self, call: &ToolCall) -> Result<Box<RawValue>> {
        if let Some(meta) = self.call_meta.lock().get(&call.id) {
            return RawValue::from_string(meta.raw_part.clone())
                .map_err(|e| AppError::Internal(format!("Invalid cached part: {}", e)));
        }
        let args = serde_json::from_str::<serde_json::Value>(&call.arguments)
            .unwrap_or_else(|_| serde_json::json!({}));
        let mut part = serde_json::json!({
            "functionCall": {"name": call.name, "args": args}
        });
        if let Some(signature) = &call.thought_signature {
            part["thoughtSignature"] = serde_json::Value::String(signature.clone());
        }
        raw_part(&part)
    }

    /// Parse a candidate's parts, registering call metadata for verbatim
    /// re-emission.
    fn parse_parts(
        call_meta: &Mutex<HashMap<String, CallMeta>>,
        counter: &AtomicU64,
        parts: &[Box<RawValue>],
    ) -> Result<(String, Vec<ToolCall>)> {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for raw in parts {
            let part: GeminiPartIn = serde_json::from_str(raw.get()).map_err(|e| {
                AppError::ProviderProtocol(format!("Malformed content part: {}", e))
            })?;
            if let Some(text) = part.text {
                content.push_str(&text);
            }
            if let Some(function_call) = part.function_call {
                let id = Self::next_call_id(counter);
                call_meta.lock().insert(
                    id.clone(),
                    CallMeta {
                        raw_part: raw.get().to_string(),
                    },
                );
                tool_calls.push(ToolCall {
                    id,
                    name: function_call.name,
                    arguments: function_call.args.to_string(),
                    thought_signature: part.thought_signature,
                });
            }
        }
        Ok((content, tool_calls))
    }
}

#[async_trait]
impl LLMClient for GeminiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionReply> {
        let body = self.build_body(request)?;
        let response = post_json_with_retry(
            &self.http,
            &self.endpoint("generateContent"),
            &self.headers(),
            &body,
        )
        .await?
        .json::<GenerateContentResponse>()
        .await
        .map_err(|e| AppError::ProviderProtocol(format!("Malformed completion: {}", e)))?;

        let candidate = response
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| AppError::ProviderProtocol("Completion had no candidates".to_string()))?;

        check_finish_reason(candidate.finish_reason.as_deref())?;

        let (content, tool_calls) = match candidate.content {
            Some(content) => Self::parse_parts(&self.call_meta, &self.call_counter, &content.parts)?,
            None => (String::new(), Vec::new()),
        };
        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            map_finish_reason(candidate.finish_reason.as_deref())
        };

        Ok(CompletionReply {
            content,
            tool_calls,
            finish_reason,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream> {
        let body = self.build_body(request)?;
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let response = post_json_with_retry(&self.http, &url, &self.headers(), &body).await?;

        let call_meta = Arc::clone(&self.call_meta);
        let counter = Arc::clone(&self.call_counter);
        let mut events = Box::pin(response.bytes_stream().eventsource());

        let stream = async_stream::stream! {
            let mut call_index = 0usize;
            let mut saw_tool_calls = false;
            let mut last_finish: Option<String> = None;

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(AppError::Provider(format!("Stream error: {}", e)));
                        return;
                    }
                };
                if event.data.trim().is_empty() {
                    continue;
                }
                let chunk: GenerateContentResponse = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(AppError::ProviderProtocol(format!(
                            "Malformed stream chunk: {}",
                            e
                        )));
                        return;
                    }
                };
                let Some(candidate) = chunk.candidates.unwrap_or_default().into_iter().next()
                else {
                    continue;
                };
                if let Some(reason) = &candidate.finish_reason {
                    last_finish = Some(reason.clone());
                }
                let Some(content) = candidate.content else { continue };
                for raw in &content.parts {
                    let part: GeminiPartIn = match serde_json::from_str(raw.get()) {
                        Ok(part) => part,
                        Err(e) => {
                            yield Err(AppError::ProviderProtocol(format!(
                                "Malformed content part: {}",
                                e
                            )));
                            return;
                        }
                    };
                    if let Some(text) = part.text {
                        if !text.is_empty() {
                            yield Ok(StreamEvent::TextDelta(text));
                        }
                    }
                    if let Some(function_call) = part.function_call {
                        let id = GeminiClient::next_call_id(&counter);
                        call_meta.lock().insert(
                            id.clone(),
                            CallMeta { raw_part: raw.get().to_string() },
                        );
                        if let Some(signature) = &part.thought_signature {
                            yield Ok(StreamEvent::Thought(signature.clone()));
                        }
                        saw_tool_calls = true;
                        yield Ok(StreamEvent::ToolCallDelta {
                            index: call_index,
                            id: Some(id),
                            name: Some(function_call.name),
                            arguments_chunk: function_call.args.to_string(),
                        });
                        call_index += 1;
                    }
                }
            }

            if let Err(e) = check_finish_reason(last_finish.as_deref()) {
                yield Err(e);
                return;
            }
            let reason = if saw_tool_calls {
                FinishReason::ToolCalls
            } else {
                map_finish_reason(last_finish.as_deref())
            };
            yield Ok(StreamEvent::Finish(reason));
        };
        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn raw_part(value: &serde_json::Value) -> Result<Box<RawValue>> {
    let text = serde_json::to_string(value)
        .map_err(|e| AppError::Internal(format!("Failed to serialize part: {}", e)))?;
    RawValue::from_string(text).map_err(|e| AppError::Internal(format!("Invalid part: {}", e)))
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("STOP") | None => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some(_) => FinishReason::Error,
    }
}

/// A dropped or rewritten signature is a protocol violation the provider
/// reports through the finish reason; surface it as such instead of letting
/// the turn loop on an error candidate.
fn check_finish_reason(reason: Option<&str>) -> Result<()> {
    if let Some(reason) = reason {
        if reason.contains("THOUGHT_SIGNATURE") {
            return Err(AppError::ProviderProtocol(format!(
                "Provider rejected the request: {}",
                reason
            )));
        }
    }
    Ok(())
}

// ============================== API types ==============================

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContentOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContentOut>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContentOut {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Box<RawValue>>,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentIn>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContentIn {
    #[serde(default)]
    parts: Vec<Box<RawValue>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPartIn {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "functionCall", default)]
    function_call: Option<GeminiFunctionCallIn>,
    #[serde(rename = "thoughtSignature", default)]
    thought_signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCallIn {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}
