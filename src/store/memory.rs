//! In-memory conversation store for development and tests

use super::{ConversationStore, StoreError};
use crate::context::{Conversation, ConversationId, NewTurn, Turn, TurnId, UserId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    next_conversation_id: ConversationId,
    next_turn_id: TurnId,
    conversations: HashMap<ConversationId, Conversation>,
    turns: HashMap<ConversationId, Vec<Turn>>,
}

/// Store kept behind a single lock; every call is one critical section
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(&self, owner_id: UserId, title: &str) -> Result<Conversation, StoreError> {
        let mut state = self.state.write().await;
        state.next_conversation_id += 1;
        let now = Utc::now();
        let conversation = Conversation {
            id: state.next_conversation_id,
            owner_id,
            title: title.to_string(),
            tags: Vec::new(),
            summary: None,
            context_summary: None,
            created_at: now,
            updated_at: now,
        };
        state.conversations.insert(conversation.id, conversation.clone());
        state.turns.insert(conversation.id, Vec::new());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.state.read().await.conversations.get(&id).cloned())
    }

    async fn list_conversations(&self, owner_id: UserId) -> Result<Vec<Conversation>, StoreError> {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(conversations)
    }

    async fn list_turns(&self, conversation_id: ConversationId) -> Result<Vec<Turn>, StoreError> {
        let state = self.state.read().await;
        let mut turns = state.turns.get(&conversation_id).cloned().unwrap_or_default();
        turns.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(turns)
    }

    async fn append_turn(&self, conversation_id: ConversationId, turn: NewTurn) -> Result<Turn, StoreError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }

        state.next_turn_id += 1;
        let now = Utc::now();
        let turn = Turn {
            id: state.next_turn_id,
            conversation_id,
            role: turn.role,
            content: turn.content,
            token_count: turn.token_count,
            created_at: now,
        };

        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.updated_at = now;
        }
        state
            .turns
            .entry(conversation_id)
            .or_default()
            .push(turn.clone());
        Ok(turn)
    }

    async fn delete_turn(&self, id: TurnId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for turns in state.turns.values_mut() {
            turns.retain(|t| t.id != id);
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: ConversationId, owner_id: UserId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if !state.conversations.get(&id).is_some_and(|c| c.owner_id == owner_id) {
            return Ok(false);
        }
        state.conversations.remove(&id);
        state.turns.remove(&id);
        Ok(true)
    }

    async fn set_title(&self, conversation_id: ConversationId, title: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        conversation.title = title.to_string();
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn set_digest(
        &self,
        conversation_id: ConversationId,
        summary: &str,
        tags: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        conversation.summary = Some(summary.to_string());
        if !tags.is_empty() {
            conversation.tags = tags.to_vec();
        }
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_compression(
        &self,
        conversation_id: ConversationId,
        context_summary: &str,
        removed: &[TurnId],
    ) -> Result<(), StoreError> {
        // Validate before mutating so a failure leaves no partial state
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }

        if let Some(turns) = state.turns.get_mut(&conversation_id) {
            turns.retain(|t| !removed.contains(&t.id));
        }
        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.context_summary = Some(context_summary.to_string());
            conversation.updated_at = Utc::now();
        }
        Ok(())
    }
}
