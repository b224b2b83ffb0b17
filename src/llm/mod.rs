//! Language-model backend interface
//!
//! The orchestrator talks to the model through [`ChatBackend`], which offers a
//! one-shot completion and an incremental text stream. The concrete
//! OpenAI-compatible client lives in [`openai`].

pub mod labeler;
pub mod openai;

pub use labeler::Labeler;
pub use openai::{strip_think_tags, OpenAiCompatibleClient};

use crate::context::ChatMessage;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Incremental text chunks from a streaming completion
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

/// A completion request over an assembled window
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Black-box language model with unbounded latency
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Return the full generated text
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;

    /// Return generated text as a stream of chunks in arrival order
    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, LlmError>;
}

/// Language-model errors
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
