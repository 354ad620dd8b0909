//! Conversation read endpoints.
//!
//! Reads go straight to the store without the turn lock.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::store::ConversationSummary;
use crate::types::{AppError, Result};
use crate::AppState;

/// Full conversation with messages.
#[derive(Debug, Serialize, ToSchema)]
pub struct ConversationDetails {
    /// Unique conversation identifier.
    pub conversation_id: String,
    /// Owning user.
    pub user: String,
    /// Messages in the conversation, ordered by time.
    pub messages: Vec<serde_json::Value>,
    /// RFC3339 formatted creation timestamp.
    pub created_at: String,
    /// RFC3339 formatted last update timestamp.
    pub updated_at: String,
}

/// List all conversations for a user.
#[utoipa::path(
    get,
    path = "/api/conversations/{user}",
    params(("user" = String, Path, description = "User identifier")),
    responses(
        (status = 200, description = "List of conversations", body = Vec<ConversationSummary>)
    ),
    tag = "conversations"
)]
pub async fn list_conversations(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.store.list_for_user(&user)?))
}

/// Get a specific conversation with all messages.
#[utoipa::path(
    get,
    path = "/api/conversations/{user}/{conversation_id}",
    params(
        ("user" = String, Path, description = "User identifier"),
        ("conversation_id" = String, Path, description = "Conversation ID")
    ),
    responses(
        (status = 200, description = "Conversation details", body = ConversationDetails),
        (status = 404, description = "Conversation not found")
    ),
    tag = "conversations"
)]
pub async fn get_conversation(
    State(state): State<AppState>,
    Path((user, conversation_id)): Path<(String, String)>,
) -> Result<Json<ConversationDetails>> {
    let conversation = state.store.get(&conversation_id)?;
    if conversation.user != user {
        return Err(AppError::NotFound(format!(
            "Conversation not found: {}",
            conversation_id
        )));
    }
    let messages = conversation
        .messages
        .iter()
        .map(|m| serde_json::to_value(m).unwrap_or_default())
        .collect();
    Ok(Json(ConversationDetails {
        conversation_id: conversation.conversation_id,
        user: conversation.user,
        messages,
        created_at: conversation.created_at.to_rfc3339(),
        updated_at: conversation.updated_at.to_rfc3339(),
    }))
}
