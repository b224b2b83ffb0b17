//! Duplex wire format

use crate::context::{Role, Turn, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of an inbound client frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundKind {
    Message,
    Audio,
}

/// Inbound frame: `{"type": "message" | "audio", "content": "..."}`
///
/// For audio the content is base64-encoded audio bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: InboundKind,

    #[serde(default, alias = "audio")]
    pub content: String,
}

/// A persisted turn as clients see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Turn> for MessageView {
    fn from(turn: &Turn) -> Self {
        Self {
            id: turn.id,
            role: turn.role,
            content: turn.content.clone(),
            created_at: turn.created_at,
        }
    }
}

/// Progress markers on the voice path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Transcribing,
    Thinking,
    Synthesizing,
}

/// Outbound frame, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status { status: TurnStatus },
    Transcription { text: String },
    UserMessage { message: MessageView },
    AssistantChunk { content: String },
    /// Base64-encoded audio
    AssistantAudio { audio: String, format: String },
    AssistantComplete { message: MessageView },
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}
