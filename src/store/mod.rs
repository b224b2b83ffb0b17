//! Persistence interface for conversations and their turns
//!
//! The core only needs ordered reads, appends, deletes and a summary field;
//! deleting a conversation cascades to its turns.
//! [`ConversationStore::apply_compression`] is the one multi-row write and must
//! be atomic.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::context::{Conversation, ConversationId, NewTurn, Turn, TurnId, UserId};
use async_trait::async_trait;

/// Durable storage for conversations and turns
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, owner_id: UserId, title: &str) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError>;

    /// The conversation if it exists and belongs to `owner_id`
    async fn get_owned_conversation(
        &self,
        id: ConversationId,
        owner_id: UserId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .get_conversation(id)
            .await?
            .filter(|c| c.owner_id == owner_id))
    }

    /// Conversations of one owner, most recently updated first
    async fn list_conversations(&self, owner_id: UserId) -> Result<Vec<Conversation>, StoreError>;

    /// Turns ordered by creation time, ties broken by id
    async fn list_turns(&self, conversation_id: ConversationId) -> Result<Vec<Turn>, StoreError>;

    async fn count_turns(&self, conversation_id: ConversationId) -> Result<usize, StoreError> {
        Ok(self.list_turns(conversation_id).await?.len())
    }

    async fn append_turn(&self, conversation_id: ConversationId, turn: NewTurn) -> Result<Turn, StoreError>;

    async fn delete_turn(&self, id: TurnId) -> Result<(), StoreError>;

    /// Remove the conversation, its turns and both summaries.
    ///
    /// Returns `false` when no conversation with that id belongs to `owner_id`.
    async fn delete_conversation(&self, id: ConversationId, owner_id: UserId) -> Result<bool, StoreError>;

    async fn set_title(&self, conversation_id: ConversationId, title: &str) -> Result<(), StoreError>;

    /// Store the human-facing digest (summary and tags)
    async fn set_digest(
        &self,
        conversation_id: ConversationId,
        summary: &str,
        tags: &[String],
    ) -> Result<(), StoreError>;

    /// Replace the context summary and delete `removed` turns in one transaction
    async fn apply_compression(
        &self,
        conversation_id: ConversationId,
        context_summary: &str,
        removed: &[TurnId],
    ) -> Result<(), StoreError>;
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
