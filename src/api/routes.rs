//! Router assembly

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{self, AppState};
use crate::api::ws;

/// Build the HTTP and WebSocket router
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/api/conversations",
            post(handlers::create_conversation).get(handlers::list_conversations),
        )
        .route("/api/conversations/batch", delete(handlers::delete_conversations))
        .route(
            "/api/conversations/:id",
            get(handlers::get_conversation)
                .put(handlers::rename_conversation)
                .delete(handlers::delete_conversation),
        )
        .route("/api/conversations/:id/digest", post(handlers::digest_conversation))
        .route("/api/conversations/:id/summarize", post(handlers::digest_conversation))
        .route("/api/conversations/:id/export", get(handlers::export_conversation))
        .route(
            "/api/chat/:id/messages",
            get(handlers::list_messages).post(handlers::send_message),
        )
        .route("/api/chat/ws/:id", get(ws::chat_socket))
        .route("/api/voice/ws/:id", get(ws::chat_socket))
        .route("/api/voice/stt", post(handlers::speech_to_text))
        .route("/api/voice/tts", post(handlers::text_to_speech))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(max_body_bytes)),
        )
        .with_state(state)
}
