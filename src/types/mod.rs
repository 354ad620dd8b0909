//! Core types used throughout the O.R.C.A. server.
//!
//! This module contains all the common data structures used for:
//! - API requests and responses
//! - Conversation messages and tool calls
//! - Tool definitions and result envelopes
//! - Error handling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ============= API Request/Response Types =============

/// Request payload for the chat ingress.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatRequest {
    /// Conversation to append to. Created lazily on first use.
    pub conversation_id: String,
    /// Identifier of the user making the request.
    pub user: String,
    /// The user's message text.
    pub content: String,
    /// Client-chosen idempotency key for this message.
    pub client_msg_id: String,
    /// Optional model name overriding the configured default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Terminal SSE event payload emitted when a turn finishes.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DoneEvent {
    /// "completed" or "failed".
    pub status: String,
    /// Final assistant text for the turn.
    pub final_content: String,
    /// All files generated during the turn, relative to the working directory.
    pub files: Vec<String>,
}

/// One entry in a workspace file listing.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FileEntry {
    /// Filename relative to the conversation working directory.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time (RFC3339).
    pub mtime: String,
}

/// Workspace listing response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FileListing {
    /// Files currently present in the working directory.
    pub files: Vec<FileEntry>,
}

// ============= Message Types =============

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions to the model (request-time only, never persisted).
    System,
    /// Message from the user.
    User,
    /// Response from the assistant.
    Assistant,
    /// Observation returned by a tool.
    Tool,
}

/// Lifecycle status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Assistant placeholder while a turn is running.
    InProgress,
    /// Immutable final state.
    Completed,
    /// The turn failed; `content` carries the error text.
    Failed,
}

/// A request by the model to call a tool.
///
/// `arguments` is kept as the raw string the provider produced; coercion into
/// a JSON mapping happens at dispatch time so malformed output (a known model
/// failure mode) can be surfaced back to the model instead of crashing here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier within the assistant message.
    pub id: String,
    /// Name of the tool to call, preserved byte-for-byte (some providers
    /// namespace names like `ns:tool`).
    pub name: String,
    /// Raw argument payload, usually a JSON object encoded as a string.
    pub arguments: String,
    /// Opaque provider-issued token that must be returned unchanged on the
    /// follow-up request carrying this call's response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned message identifier.
    pub server_msg_id: String,
    /// The role of the message sender.
    pub role: MessageRole,
    /// Message text. May be empty for pure tool-call messages.
    #[serde(default)]
    pub content: String,
    /// Tool calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `role=tool`: id of the originating tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `role=tool`: name of the tool that produced this observation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Files produced during this message, relative to the working directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_files: Vec<String>,
    /// Lifecycle status.
    pub status: MessageStatus,
    /// Idempotency key supplied by the client (user messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    /// When the message was inserted.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a completed user message.
    pub fn user(content: impl Into<String>, client_msg_id: impl Into<String>) -> Self {
        Self {
            server_msg_id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            generated_files: Vec::new(),
            status: MessageStatus::Completed,
            client_msg_id: Some(client_msg_id.into()),
            created_at: Utc::now(),
        }
    }

    /// Build an in-progress assistant placeholder.
    pub fn assistant_placeholder() -> Self {
        Self {
            server_msg_id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::Assistant,
            content: String::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            generated_files: Vec::new(),
            status: MessageStatus::InProgress,
            client_msg_id: None,
            created_at: Utc::now(),
        }
    }

    /// Build a completed tool observation message.
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        generated_files: Vec<String>,
    ) -> Self {
        Self {
            server_msg_id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            generated_files,
            status: MessageStatus::Completed,
            client_msg_id: None,
            created_at: Utc::now(),
        }
    }

    /// Build a request-time system message. Never persisted.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            server_msg_id: String::new(),
            role: MessageRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            generated_files: Vec::new(),
            status: MessageStatus::Completed,
            client_msg_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Append `additions` to `files`, preserving first-seen order and skipping
/// entries already present.
pub fn merge_generated_files(files: &mut Vec<String>, additions: &[String]) {
    for a in additions {
        if !files.iter().any(|f| f == a) {
            files.push(a.clone());
        }
    }
}

// ============= Tool Types =============

/// Definition of a tool as published to an LLM.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ToolDefinition {
    /// Unique name of the tool.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema defining the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Why a tool invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    /// No tool registered under the requested name.
    UnknownTool,
    /// Arguments were not a well-formed single JSON object.
    MalformedArguments,
    /// Required parameters missing or of the wrong type.
    ArgumentValidation,
    /// The handler exceeded its descriptor deadline.
    Timeout,
    /// The handler returned an error or panicked.
    HandlerFailure,
}

/// Structured result envelope produced by the tool registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// "success" or "failed".
    pub status: String,
    /// Result data on success.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Files the invocation created or modified in the working directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_files: Vec<String>,
    /// Failure classification, used by the orchestrator's retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
}

impl ToolOutcome {
    /// Successful invocation with result data.
    pub fn success(data: serde_json::Value, generated_files: Vec<String>) -> Self {
        Self {
            status: "success".to_string(),
            data,
            error: None,
            generated_files,
            failure: None,
        }
    }

    /// Failed invocation with a classification and error text.
    pub fn failed(failure: ToolFailure, error: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            data: serde_json::Value::Null,
            error: Some(error.into()),
            generated_files: Vec::new(),
            failure: Some(failure),
        }
    }

    /// Whether the invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    /// The observation text fed back to the model: compact JSON of the data
    /// on success, the error text verbatim on failure.
    pub fn observation(&self) -> String {
        if self.is_success() {
            serde_json::to_string(&self.data).unwrap_or_else(|_| "null".to_string())
        } else {
            self.error.clone().unwrap_or_else(|| "tool failed".to_string())
        }
    }
}

// ============= Error Types =============

/// Application-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Conversation store read/write failed. Fatal for the current turn.
    #[error("Store error: {0}")]
    Store(String),

    /// LLM provider call failed.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The provider returned a malformed or protocol-violating response.
    #[error("Provider protocol error: {0}")]
    ProviderProtocol(String),

    /// Tool dispatch failed at the registry layer.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Sandbox execution failed.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Requested resource was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input validation failed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// External service call failed.
    #[error("External service error: {0}")]
    External(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::Store(msg) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Provider(msg) => (axum::http::StatusCode::BAD_GATEWAY, msg),
            AppError::ProviderProtocol(msg) => (axum::http::StatusCode::BAD_GATEWAY, msg),
            AppError::Tool(msg) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Sandbox(msg) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::NotFound(msg) => (axum::http::StatusCode::NOT_FOUND, msg),
            AppError::InvalidInput(msg) => (axum::http::StatusCode::BAD_REQUEST, msg),
            AppError::Configuration(msg) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::External(msg) => (axum::http::StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, axum::Json(body)).into_response()
    }
}

/// A specialized Result type for O.R.C.A. operations.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_generated_files_dedup_order() {
        let mut files = vec!["a.png".to_string(), "b.csv".to_string()];
        merge_generated_files(
            &mut files,
            &["b.csv".to_string(), "c.txt".to_string(), "a.png".to_string()],
        );
        assert_eq!(files, vec!["a.png", "b.csv", "c.txt"]);
    }

    #[test]
    fn test_tool_outcome_observation() {
        let ok = ToolOutcome::success(serde_json::json!({"result": 3}), vec![]);
        assert_eq!(ok.observation(), r#"{"result":3}"#);

        let failed = ToolOutcome::failed(ToolFailure::Timeout, "tool timed out after 30s");
        assert!(!failed.is_success());
        assert_eq!(failed.observation(), "tool timed out after 30s");
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::user("hello", "c1");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, "hello");
        assert_eq!(back.client_msg_id.as_deref(), Some("c1"));
        assert_eq!(back.status, MessageStatus::Completed);
        // Empty collections are skipped on the wire
        assert!(!json.contains("tool_calls"));
    }
}
