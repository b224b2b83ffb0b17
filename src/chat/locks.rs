//! Per-conversation mutual exclusion
//!
//! At most one turn may be in flight per conversation, whichever transport it
//! arrived on. Entries are dropped once nobody holds or waits on them.

use crate::context::ConversationId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct ConversationLocks {
    locks: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
}

/// Held for the duration of one turn
#[derive(Debug)]
pub struct ConversationGuard {
    conversation_id: ConversationId,
    locks: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other turn holds `conversation_id`
    pub async fn acquire(&self, conversation_id: ConversationId) -> ConversationGuard {
        let lock = self
            .locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        ConversationGuard {
            conversation_id,
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of conversations with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still references the mutex: nobody is waiting
        self.locks
            .remove_if(&self.conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
