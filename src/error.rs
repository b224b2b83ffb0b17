//! Crate-level error type

use crate::auth::AuthError;
use crate::context::{ConversationId, SummarizerError};
use crate::llm::LlmError;
use crate::speech::SpeechError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the orchestrator and the API layer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Message content is empty")]
    EmptyMessage,

    /// Missing, or owned by someone else; the two are indistinguishable to callers
    #[error("Conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Speech error: {0}")]
    Speech(#[from] SpeechError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Model stream idle for {0} seconds")]
    StreamTimeout(u64),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("No speech detected")]
    NoSpeech,

    #[error("Conversation title is empty")]
    EmptyTitle,
}

impl Error {
    /// Stable text safe to show to clients; details stay in the logs
    pub fn client_message(&self) -> &'static str {
        match self {
            Error::EmptyMessage => "Message content is empty",
            Error::EmptyTitle => "Title is empty",
            Error::ConversationNotFound(_) => "Conversation not found",
            Error::Llm(_) | Error::StreamTimeout(_) => "Failed to get AI response",
            Error::Speech(SpeechError::Synthesis(_)) => "Speech synthesis failed",
            Error::Speech(_) => "Speech recognition failed",
            Error::InvalidAudio(_) => "Invalid audio data",
            Error::NoSpeech => "No speech detected",
            Error::Auth(_) => "Not authenticated",
            Error::Cancelled => "Request cancelled",
            Error::Configuration(_) | Error::Store(_) => "Internal server error",
        }
    }

    /// Whether the caller sent something unacceptable, as opposed to a server-side failure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::EmptyMessage
                | Error::EmptyTitle
                | Error::ConversationNotFound(_)
                | Error::InvalidAudio(_)
                | Error::NoSpeech
                | Error::Auth(_)
        )
    }
}

impl From<SummarizerError> for Error {
    fn from(e: SummarizerError) -> Self {
        match e {
            SummarizerError::Backend(e) => Error::Llm(e),
            SummarizerError::EmptySummary => {
                Error::Llm(LlmError::InvalidResponse("empty summary".to_string()))
            }
        }
    }
}
