//! Duplex chat sessions over WebSocket
//!
//! Authentication and the ownership check happen before the upgrade, so a
//! rejected client never gets a socket. Each session runs three parts: a
//! writer task draining the session's event queue into the socket, a
//! processor task running one turn at a time, and the reader loop. When the
//! reader sees the client go away it cancels the in-flight turn.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::handlers::{api_error, AppState};
use crate::api::models::{error_codes, ApiError};
use crate::auth::Principal;
use crate::chat::{ChatOrchestrator, ClientMessage, InboundKind, ServerEvent, Session};
use crate::context::ConversationId;

/// Outbound events buffered per session
const EVENT_QUEUE: usize = 256;
/// Inbound frames waiting for the processor
const INBOUND_QUEUE: usize = 8;

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
}

/// GET /api/chat/ws/:id and /api/voice/ws/:id
///
/// The upgrade is only inspected after the caller has been authorized.
pub async fn chat_socket(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<SocketQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let principal = match query.token.as_deref().map(|t| state.verifier.verify(t)) {
        Some(Ok(principal)) => principal,
        Some(Err(e)) => {
            warn!("Rejected socket for conversation {}: {}", conversation_id, e);
            return unauthorized();
        }
        None => return unauthorized(),
    };

    if let Err(e) = state
        .orchestrator
        .authorize(principal.user_id, conversation_id)
        .await
    {
        return api_error(e).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let orchestrator = Arc::clone(&state.orchestrator);
    ws.on_upgrade(move |socket| run_session(socket, orchestrator, principal, conversation_id))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new(error_codes::UNAUTHORIZED, "Not authenticated")),
    )
        .into_response()
}

async fn run_session(
    socket: WebSocket,
    orchestrator: Arc<ChatOrchestrator>,
    principal: Principal,
    conversation_id: ConversationId,
) {
    let (mut sink, mut source) = socket.split();
    let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(EVENT_QUEUE);
    let session = Session::new(conversation_id, principal.user_id, events_tx);
    let registration = orchestrator.registry().attach(&session);
    let cancel = CancellationToken::new();

    info!(
        "Session {} opened by user {} on conversation {}",
        session.id, principal.user_id, conversation_id
    );

    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unserializable event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<ClientMessage>(INBOUND_QUEUE);
    let processor = {
        let orchestrator = Arc::clone(&orchestrator);
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    message = inbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                match message.kind {
                    InboundKind::Message => {
                        orchestrator.run_turn(&session, &message.content, &cancel).await
                    }
                    InboundKind::Audio => {
                        orchestrator
                            .run_voice_turn(&session, &message.content, &cancel)
                            .await
                    }
                }
            }
        })
    };

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if !accept_frame(&session, &inbound_tx, &text).await {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Session {} socket error: {}", session.id, e);
                break;
            }
        }
    }

    // Client is gone: abandon any in-flight turn
    cancel.cancel();
    drop(inbound_tx);
    if let Err(e) = processor.await {
        warn!("Session {} processor failed: {}", session.id, e);
    }

    let session_id = session.id;
    drop(registration);
    drop(session);
    let _ = writer.await;

    info!("Session {} closed", session_id);
}

/// Queue one text frame for the processor.
///
/// A full queue holds the reader back until a turn finishes, so the in-flight
/// turn never sees a spurious `error`. Returns `false` once the processor is gone.
async fn accept_frame(session: &Session, inbound_tx: &mpsc::Sender<ClientMessage>, text: &str) -> bool {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => inbound_tx.send(message).await.is_ok(),
        Err(e) => {
            debug!("Session {} sent an invalid frame: {}", session.id, e);
            session.emit(ServerEvent::error("Invalid message format")).await;
            true
        }
    }
}
