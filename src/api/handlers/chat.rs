//! Chat ingress: idempotent POST in, SSE progress stream out.
//!
//! One POST drives one turn. The handler pins the conversation's turn lock,
//! inserts the user message and the assistant placeholder, then spawns the
//! orchestrator and pumps its progress channel to the client as SSE with
//! periodic heartbeats. The orchestrator task owns finalization, so a
//! client that disconnects mid-turn still gets a persisted assistant
//! message.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    Json,
};
use futures::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agents::{progress_channel, ProgressEvent, ReactAgent};
use crate::types::{AppError, ChatRequest, MessageStatus, Result};
use crate::AppState;

fn sse_event(name: &str, payload: serde_json::Value) -> Event {
    Event::default()
        .event(name)
        .data(payload.to_string())
}

fn progress_to_event(event: &ProgressEvent) -> Event {
    match event {
        ProgressEvent::TextDelta { text } => sse_event("text_delta", json!({ "text": text })),
        ProgressEvent::ToolCallStarted { name, arguments } => sse_event(
            "tool_call_started",
            json!({ "name": name, "arguments": arguments }),
        ),
        ProgressEvent::ToolCallResult {
            name,
            status,
            files_added,
        } => sse_event(
            "tool_call_result",
            json!({ "name": name, "status": status, "files_added": files_added }),
        ),
        ProgressEvent::FilesGenerated { files } => {
            sse_event("files_generated", json!({ "files": files }))
        }
        ProgressEvent::Done {
            status,
            final_content,
            files,
        } => sse_event(
            "done",
            json!({ "status": status, "final_content": final_content, "files": files }),
        ),
    }
}

fn status_label(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::InProgress => "in_progress",
        MessageStatus::Completed => "completed",
        MessageStatus::Failed => "failed",
    }
}

type EventStream = std::pin::Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>>;

/// Chat with the agent. Returns an SSE stream of turn progress.
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "SSE stream of turn progress", content_type = "text/event-stream"),
        (status = 400, description = "Invalid input")
    ),
    tag = "chat"
)]
pub async fn chat(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<KeepAliveStream<EventStream>>> {
    if payload.conversation_id.is_empty() || payload.user.is_empty() {
        return Err(AppError::InvalidInput(
            "conversation_id and user are required".to_string(),
        ));
    }
    let heartbeat = Duration::from_secs(state.config.server.heartbeat_secs);

    // Read-only idempotency probe before taking the turn lock: a replay of
    // a message whose turn is still running must answer promptly, not queue
    // behind it.
    if let Some(hit) = state.store.idempotency_lookup(
        &payload.conversation_id,
        &payload.user,
        &payload.client_msg_id,
    )? {
        info!(
            conversation_id = %payload.conversation_id,
            server_msg_id = %hit.server_msg_id,
            "Idempotent replay"
        );
        let first = sse_event(
            "server_msg_id",
            json!({
                "server_msg_id": hit.server_msg_id,
                "conversation_id": payload.conversation_id,
            }),
        );
        let done = sse_event(
            "done",
            json!({
                "status": status_label(hit.turn_status),
                "final_content": "",
                "files": [],
            }),
        );
        let stream: EventStream = Box::pin(futures::stream::iter(vec![Ok(first), Ok(done)]));
        return Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat)));
    }

    // Take the turn lock for the rest of the turn. The guard moves into the
    // orchestrator task and is released when the turn finalizes.
    let guard = state
        .store
        .turn_lock(&payload.conversation_id)
        .lock_owned()
        .await;

    // Re-checks the idempotency key under the lock: two concurrent POSTs
    // with the same key serialize here and the loser gets the hit.
    let appended = state.store.append_user_message(
        &payload.conversation_id,
        &payload.user,
        &payload.content,
        &payload.client_msg_id,
    )?;
    if appended.deduplicated {
        let first = sse_event(
            "server_msg_id",
            json!({
                "server_msg_id": appended.server_msg_id,
                "conversation_id": payload.conversation_id,
            }),
        );
        let done = sse_event(
            "done",
            json!({
                "status": status_label(appended.turn_status),
                "final_content": "",
                "files": [],
            }),
        );
        let stream: EventStream = Box::pin(futures::stream::iter(vec![Ok(first), Ok(done)]));
        return Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat)));
    }

    let placeholder_id = state
        .store
        .create_assistant_placeholder(&payload.conversation_id, &payload.user)?;

    let model_name = payload
        .model
        .clone()
        .unwrap_or_else(|| state.provider_registry.default_model().to_string());

    let cancel = CancellationToken::new();
    state
        .active_turns
        .lock()
        .insert(payload.conversation_id.clone(), cancel.clone());

    let (progress, mut receiver) = progress_channel();
    let agent = ReactAgent::new(
        state.store.clone(),
        state.tool_registry.clone(),
        state.provider_registry.clone(),
        state.config.agent.max_iterations,
        state.config.agent.system_prompt.clone(),
    );

    {
        let state = state.clone();
        let conversation_id = payload.conversation_id.clone();
        let placeholder = placeholder_id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            agent
                .run_turn(&conversation_id, &placeholder, &model_name, progress, cancel)
                .await;
            state.active_turns.lock().remove(&conversation_id);
        });
    }

    let first = sse_event(
        "server_msg_id",
        json!({
            "server_msg_id": appended.server_msg_id,
            "conversation_id": payload.conversation_id,
        }),
    );

    let stream: EventStream = Box::pin(async_stream::stream! {
        yield Ok(first);
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            let is_done = matches!(event, ProgressEvent::Done { .. });
                            yield Ok(progress_to_event(&event));
                            if is_done {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    yield Ok(sse_event("heartbeat", json!({})));
                }
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat)))
}

/// Cancel the in-flight turn of a conversation, if any. The turn still
/// finalizes into history; cancellation propagates into the active tool.
#[utoipa::path(
    post,
    path = "/api/chat/{conversation_id}/cancel",
    params(("conversation_id" = String, Path, description = "Conversation ID")),
    responses((status = 200, description = "Cancellation signal result")),
    tag = "chat"
)]
pub async fn cancel_turn(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = {
        let turns = state.active_turns.lock();
        match turns.get(&conversation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    };
    info!(%conversation_id, cancelled, "Cancel requested");
    Json(json!({ "cancelled": cancelled }))
}
