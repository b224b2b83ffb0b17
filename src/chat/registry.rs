//! Live duplex sessions keyed by conversation

use super::events::ServerEvent;
use crate::context::{ConversationId, UserId};
use crate::metrics::METRICS;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

/// One duplex connection bound to a conversation and its owner
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    events: mpsc::Sender<ServerEvent>,
}

impl Session {
    pub fn new(
        conversation_id: ConversationId,
        user_id: UserId,
        events: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            user_id,
            events,
        }
    }

    /// Queue an event for this session's writer; false once the writer is gone
    pub async fn emit(&self, event: ServerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// Tracks live sessions; safe under concurrent register/unregister
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<ConversationId, HashMap<SessionId, mpsc::Sender<ServerEvent>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session; returns false if it was already registered
    pub fn register(&self, session: &Session) -> bool {
        let added = self
            .sessions
            .entry(session.conversation_id)
            .or_default()
            .insert(session.id, session.events.clone())
            .is_none();

        if added {
            METRICS.session_opened();
            info!(
                "Session {} joined conversation {}",
                session.id, session.conversation_id
            );
        }
        added
    }

    /// Remove a session; returns false (and does nothing) if it was not registered
    pub fn unregister(&self, session_id: SessionId, conversation_id: ConversationId) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.sessions.get_mut(&conversation_id) {
            removed = entry.remove(&session_id).is_some();
        }
        self.sessions
            .remove_if(&conversation_id, |_, sessions| sessions.is_empty());

        if removed {
            METRICS.session_closed();
            info!("Session {} left conversation {}", session_id, conversation_id);
        }
        removed
    }

    /// Register `session` and unregister it when the guard drops
    pub fn attach(&self, session: &Session) -> RegistrationGuard {
        self.register(session);
        RegistrationGuard {
            registry: self.clone(),
            session_id: session.id,
            conversation_id: session.conversation_id,
        }
    }

    pub fn session_count(&self, conversation_id: ConversationId) -> usize {
        self.sessions
            .get(&conversation_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn total_sessions(&self) -> usize {
        self.sessions.iter().map(|entry| entry.len()).sum()
    }

    /// Deliver `event` to every session on the conversation except `except`.
    ///
    /// Never waits: a session whose queue is full misses the event.
    pub fn broadcast(
        &self,
        conversation_id: ConversationId,
        event: &ServerEvent,
        except: Option<SessionId>,
    ) -> usize {
        let Some(sessions) = self.sessions.get(&conversation_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, sender) in sessions.iter() {
            if Some(*id) == except {
                continue;
            }
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Session {} is lagging, dropped broadcast event", id)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Session {} closed before broadcast", id)
                }
            }
        }
        delivered
    }
}

/// Unregisters its session on drop, on both normal and error paths
pub struct RegistrationGuard {
    registry: SessionRegistry,
    session_id: SessionId,
    conversation_id: ConversationId,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.session_id, self.conversation_id);
    }
}
