//! Short labels for conversations: titles and topic tags

use super::{ChatBackend, CompletionRequest, LlmError};
use crate::context::{ChatMessage, DEFAULT_TITLE};
use std::sync::Arc;
use tracing::debug;

const TITLE_INSTRUCTION: &str = "Generate a short title (at most 20 words) for a conversation that \
    starts with the user's message below. Output only the title.";
const TAGS_INSTRUCTION: &str = "You generate concise tags for conversations.";
const MAX_TITLE_CHARS: usize = 50;
const MAX_TAGS: usize = 5;

/// Generates titles and tags with the summary model
#[derive(Clone)]
pub struct Labeler {
    backend: Arc<dyn ChatBackend>,
    tags_prompt: String,
}

impl Labeler {
    pub fn new(backend: Arc<dyn ChatBackend>, tags_prompt: impl Into<String>) -> Self {
        Self {
            backend,
            tags_prompt: tags_prompt.into(),
        }
    }

    /// Title derived from the first user message
    pub async fn generate_title(&self, first_message: &str) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(TITLE_INSTRUCTION),
            ChatMessage::user(first_message),
        ])
        .with_max_tokens(50)
        .with_temperature(0.3);

        let raw = self.backend.complete(request).await?;
        let title = clean_title(&raw);
        debug!("Generated title: {}", title);
        Ok(title)
    }

    /// Up to five topic tags for a transcript
    pub async fn generate_tags(&self, text: &str) -> Result<Vec<String>, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(TAGS_INSTRUCTION),
            ChatMessage::user(format!("{}\n\n{}", self.tags_prompt, text)),
        ])
        .with_max_tokens(100)
        .with_temperature(0.3);

        let raw = self.backend.complete(request).await?;
        Ok(parse_tags(&raw))
    }
}

fn clean_title(raw: &str) -> String {
    let title: String = raw
        .trim()
        .trim_matches('"')
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();

    if title.trim().is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title.trim().to_string()
    }
}

/// Split on ASCII or full-width commas, drop blanks, keep the first five
fn parse_tags(raw: &str) -> Vec<String> {
    raw.replace('，', ",")
        .split(',')
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .take(MAX_TAGS)
        .collect()
}
