//! LLM-based summarization for running summary compression

use crate::context::ChatMessage;
use crate::llm::{ChatBackend, CompletionRequest, LlmError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const SUMMARIZER_SYSTEM_PROMPT: &str =
    "You are a concise summarizer. Extract key information and compress it efficiently.";

/// Summarizer trait for different summarization strategies
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a transcript (or an earlier summary) into a concise brief
    async fn summarize(&self, text: &str) -> Result<String, SummarizerError>;
}

/// Configuration for LLM summarizer
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub instruction: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            instruction: "Summarize the key points of the following conversation, keeping \
                important facts and decisions. Output a concise summary:"
                .to_string(),
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Summarizer backed by the (non-streaming) summary model
pub struct LlmSummarizer {
    backend: Arc<dyn ChatBackend>,
    config: SummarizerConfig,
}

impl LlmSummarizer {
    pub fn new(backend: Arc<dyn ChatBackend>, config: SummarizerConfig) -> Self {
        Self { backend, config }
    }

    fn build_request(&self, text: &str) -> CompletionRequest {
        let mut request = CompletionRequest::new(vec![
            ChatMessage::system(SUMMARIZER_SYSTEM_PROMPT),
            ChatMessage::user(format!("{}\n\n{}", self.config.instruction, text)),
        ]);
        request.max_tokens = self.config.max_tokens;
        request.temperature = self.config.temperature;
        request
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, SummarizerError> {
        debug!("Summarizing {} characters", text.len());

        let summary = self.backend.complete(self.build_request(text)).await?;
        let summary = summary.trim().to_string();

        if summary.is_empty() {
            return Err(SummarizerError::EmptySummary);
        }

        Ok(summary)
    }
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Backend error: {0}")]
    Backend(#[from] LlmError),

    #[error("Backend returned an empty summary")]
    EmptySummary,
}
