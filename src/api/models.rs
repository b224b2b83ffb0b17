//! Request and response bodies for the HTTP API

use crate::chat::{ConversationExport, MessageView};
use crate::context::{Conversation, ConversationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// API error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Standard error codes
pub mod error_codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
}

/// Conversation as listed to its owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationView {
    pub id: ConversationId,
    pub title: String,
    pub tags: Vec<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Conversation> for ConversationView {
    fn from(conversation: Conversation) -> Self {
        Self {
            id: conversation.id,
            title: conversation.title,
            tags: conversation.tags,
            summary: conversation.summary,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameConversationRequest {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchDeleteRequest {
    pub ids: Vec<ConversationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDeleteResponse {
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Markdown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
}

/// Export body; the shape depends on the requested format
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ExportResponse {
    Json {
        id: ConversationId,
        title: String,
        tags: Vec<String>,
        summary: Option<String>,
        created_at: DateTime<Utc>,
        messages: Vec<MessageView>,
    },
    Markdown {
        content: String,
        filename: String,
    },
}

impl ExportResponse {
    pub fn render(export: ConversationExport, format: ExportFormat) -> Self {
        match format {
            ExportFormat::Markdown => ExportResponse::Markdown {
                content: export.to_markdown(),
                filename: export.filename("md"),
            },
            ExportFormat::Json => {
                let messages = export.turns.iter().map(MessageView::from).collect();
                let conversation = export.conversation;
                ExportResponse::Json {
                    id: conversation.id,
                    title: conversation.title,
                    tags: conversation.tags,
                    summary: conversation.summary,
                    created_at: conversation.created_at,
                    messages,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestRequest {
    #[serde(default = "default_with_tags")]
    pub with_tags: bool,
}

fn default_with_tags() -> bool {
    true
}

impl Default for DigestRequest {
    fn default() -> Self {
        Self {
            with_tags: default_with_tags(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisResponse {
    /// Base64-encoded audio
    pub audio: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}
