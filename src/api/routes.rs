use crate::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(crate::api::handlers::chat::chat))
        .route(
            "/chat/{conversation_id}/cancel",
            post(crate::api::handlers::chat::cancel_turn),
        )
        .route(
            "/conversations/{user}",
            get(crate::api::handlers::conversations::list_conversations),
        )
        .route(
            "/conversations/{user}/{conversation_id}",
            get(crate::api::handlers::conversations::get_conversation),
        )
        .route(
            "/outputs/list/{conversation_id}",
            get(crate::api::handlers::files::list_outputs),
        )
        .route(
            "/stream/{conversation_id}/{*filename}",
            get(crate::api::handlers::files::stream_file),
        )
}
