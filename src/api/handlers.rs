//! REST handlers

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::api::models::*;
use crate::auth::{bearer_token, AuthError, Principal, TokenVerifier};
use crate::chat::{ChatExchange, ChatOrchestrator, MessageView};
use crate::context::ConversationId;
use crate::error::Error;
use crate::metrics::METRICS;
use crate::speech::SpeechError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub verifier: Arc<TokenVerifier>,
}

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

/// Map a crate error to a status and a body without internal detail
pub fn api_error(e: Error) -> (StatusCode, Json<ApiError>) {
    let (status, code) = match &e {
        Error::EmptyMessage | Error::EmptyTitle | Error::InvalidAudio(_) | Error::NoSpeech => {
            (StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR)
        }
        Error::ConversationNotFound(_) => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
        Error::Auth(_) => (StatusCode::UNAUTHORIZED, error_codes::UNAUTHORIZED),
        Error::StreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, error_codes::TIMEOUT),
        Error::Llm(_)
        | Error::Speech(SpeechError::Transcription(_))
        | Error::Speech(SpeechError::Synthesis(_)) => {
            (StatusCode::BAD_GATEWAY, error_codes::UPSTREAM_ERROR)
        }
        Error::Speech(_) => (StatusCode::SERVICE_UNAVAILABLE, error_codes::UNAVAILABLE),
        Error::Configuration(_) | Error::Store(_) | Error::Cancelled => {
            (StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR)
        }
    };

    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    (status, Json(ApiError::new(code, e.client_message())))
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or(AuthError::MissingToken)
            .map_err(|e| api_error(e.into()))?;

        state.verifier.verify(token).map_err(|e| api_error(e.into()))
    }
}

/// Liveness probe
///
/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.orchestrator.registry().total_sessions(),
    })
}

/// Prometheus exposition
///
/// GET /metrics
pub async fn metrics() -> String {
    METRICS.export_prometheus()
}

/// POST /api/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
    principal: Principal,
    request: Option<Json<CreateConversationRequest>>,
) -> ApiResult<ConversationView> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let conversation = state
        .orchestrator
        .create_conversation(principal.user_id, request.title.as_deref())
        .await
        .map_err(api_error)?;

    info!("User {} created conversation {}", principal.user_id, conversation.id);
    Ok(Json(conversation.into()))
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    principal: Principal,
) -> ApiResult<Vec<ConversationView>> {
    let conversations = state
        .orchestrator
        .list_conversations(principal.user_id)
        .await
        .map_err(api_error)?;

    Ok(Json(conversations.into_iter().map(Into::into).collect()))
}

/// GET /api/conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    principal: Principal,
    Path(conversation_id): Path<ConversationId>,
) -> ApiResult<ConversationView> {
    let conversation = state
        .orchestrator
        .authorize(principal.user_id, conversation_id)
        .await
        .map_err(api_error)?;

    Ok(Json(conversation.into()))
}

/// PUT /api/conversations/:id
pub async fn rename_conversation(
    State(state): State<AppState>,
    principal: Principal,
    Path(conversation_id): Path<ConversationId>,
    Json(request): Json<RenameConversationRequest>,
) -> ApiResult<ConversationView> {
    let conversation = state
        .orchestrator
        .rename_conversation(principal.user_id, conversation_id, &request.title)
        .await
        .map_err(api_error)?;

    Ok(Json(conversation.into()))
}

/// Delete a conversation with its messages and summaries
///
/// DELETE /api/conversations/:id
pub async fn delete_conversation(
    State(state): State<AppState>,
    principal: Principal,
    Path(conversation_id): Path<ConversationId>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .orchestrator
        .delete_conversation(principal.user_id, conversation_id)
        .await
        .map_err(api_error)?;

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/conversations/batch
pub async fn delete_conversations(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<BatchDeleteRequest>,
) -> ApiResult<BatchDeleteResponse> {
    let deleted = state
        .orchestrator
        .delete_conversations(principal.user_id, &request.ids)
        .await
        .map_err(api_error)?;

    Ok(Json(BatchDeleteResponse { deleted }))
}

/// GET /api/conversations/:id/export?format=json|markdown
pub async fn export_conversation(
    State(state): State<AppState>,
    principal: Principal,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<ExportResponse> {
    let export = state
        .orchestrator
        .export_conversation(principal.user_id, conversation_id)
        .await
        .map_err(api_error)?;

    Ok(Json(ExportResponse::render(export, query.format)))
}

/// GET /api/chat/:id/messages
pub async fn list_messages(
    State(state): State<AppState>,
    principal: Principal,
    Path(conversation_id): Path<ConversationId>,
) -> ApiResult<Vec<MessageView>> {
    let turns = state
        .orchestrator
        .list_messages(principal.user_id, conversation_id)
        .await
        .map_err(api_error)?;

    Ok(Json(turns.iter().map(MessageView::from).collect()))
}

/// Send a message and wait for the full reply
///
/// POST /api/chat/:id/messages
pub async fn send_message(
    State(state): State<AppState>,
    principal: Principal,
    Path(conversation_id): Path<ConversationId>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<ChatExchange> {
    let exchange = state
        .orchestrator
        .send_message(principal.user_id, conversation_id, &request.content)
        .await
        .map_err(api_error)?;

    Ok(Json(exchange))
}

/// Regenerate the conversation's summary and tags
///
/// POST /api/conversations/:id/digest (also served as /summarize)
pub async fn digest_conversation(
    State(state): State<AppState>,
    principal: Principal,
    Path(conversation_id): Path<ConversationId>,
    request: Option<Json<DigestRequest>>,
) -> ApiResult<ConversationView> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let conversation = state
        .orchestrator
        .digest(principal.user_id, conversation_id, request.with_tags)
        .await
        .map_err(api_error)?;

    Ok(Json(conversation.into()))
}

/// Raw audio body in, text out
///
/// POST /api/voice/stt
pub async fn speech_to_text(
    State(state): State<AppState>,
    principal: Principal,
    body: Bytes,
) -> ApiResult<TranscriptionResponse> {
    if body.is_empty() {
        return Err(api_error(Error::InvalidAudio("empty body".to_string())));
    }

    info!("User {} transcribing {} bytes", principal.user_id, body.len());
    let text = state.orchestrator.transcribe(body).await.map_err(api_error)?;
    Ok(Json(TranscriptionResponse { text }))
}

/// POST /api/voice/tts
pub async fn text_to_speech(
    State(state): State<AppState>,
    _principal: Principal,
    Json(request): Json<SynthesisRequest>,
) -> ApiResult<SynthesisResponse> {
    if request.text.trim().is_empty() {
        return Err(api_error(Error::EmptyMessage));
    }

    let synthesized = state
        .orchestrator
        .synthesize(&request.text)
        .await
        .map_err(api_error)?;

    Ok(Json(SynthesisResponse {
        audio: BASE64.encode(&synthesized.audio),
        format: synthesized.format,
    }))
}
