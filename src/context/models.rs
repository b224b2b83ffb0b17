//! Data models for conversations, turns and model windows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversation identifier as assigned by the store
pub type ConversationId = i64;

/// Turn identifier as assigned by the store
pub type TurnId = i64;

/// User identifier supplied by the identity layer
pub type UserId = i64;

/// Title given to conversations until one is generated
pub const DEFAULT_TITLE: &str = "New conversation";

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A turn that has not been persisted yet
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub role: Role,
    pub content: String,
    pub token_count: usize,
}

impl NewTurn {
    pub fn new(role: Role, content: impl Into<String>, token_count: usize) -> Self {
        Self {
            role,
            content: content.into(),
            token_count,
        }
    }
}

/// Conversation metadata; turns are loaded separately
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub owner_id: UserId,
    pub title: String,
    pub tags: Vec<String>,
    /// Human-facing digest of the whole conversation
    pub summary: Option<String>,
    /// Running summary of turns folded away by compression
    pub context_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE
    }

    /// Stored context summary, treating an empty string as absent
    pub fn stored_summary(&self) -> Option<&str> {
        self.context_summary
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

/// Role-tagged text sent to the language model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}
