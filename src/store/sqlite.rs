//! SQLite-backed conversation store
//!
//! Blocking rusqlite calls run on the blocking pool; the connection lock is
//! taken inside each call and released before the call returns, so no store
//! handle outlives a single operation.

use super::{ConversationStore, StoreError};
use crate::context::{Conversation, ConversationId, NewTurn, Role, Turn, TurnId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const CONVERSATION_COLUMNS: &str =
    "id, owner_id, title, tags, summary, context_summary, created_at, updated_at";

/// SQLite store shared across tasks
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`; `:memory:` gives a private database
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(format!("Failed to create data dir: {}", e)))?;
            }
            let conn = Connection::open(path)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!("SQLite journal mode: {}", mode);
            conn
        };

        conn.execute_batch(include_str!("schema.sql"))?;
        info!("Conversation store ready at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Database(format!("Connection lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Store task failed: {}", e)))?
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

struct ConversationRow {
    id: i64,
    owner_id: i64,
    title: String,
    tags: String,
    summary: Option<String>,
    context_summary: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ConversationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            tags: row.get(3)?,
            summary: row.get(4)?,
            context_summary: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, StoreError> {
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| StoreError::Corrupt(format!("bad tags: {}", e)))?;
        Ok(Conversation {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title,
            tags,
            summary: self.summary,
            context_summary: self.context_summary,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct TurnRow {
    id: i64,
    conversation_id: i64,
    role: String,
    content: String,
    token_count: i64,
    created_at: String,
}

impl TurnRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            token_count: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_turn(self) -> Result<Turn, StoreError> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown role {:?}", self.role)))?;
        Ok(Turn {
            id: self.id,
            conversation_id: self.conversation_id,
            role,
            content: self.content,
            token_count: usize::try_from(self.token_count).unwrap_or(0),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn load_conversation(conn: &Connection, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
    conn.query_row(&sql, params![id], ConversationRow::from_row)
        .optional()?
        .map(ConversationRow::into_conversation)
        .transpose()
}

fn touch(conn: &Connection, id: ConversationId, now: &str) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?)
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, owner_id: UserId, title: &str) -> Result<Conversation, StoreError> {
        let title = title.to_string();
        self.with_conn(move |conn| {
            let now = timestamp(Utc::now());
            conn.execute(
                "INSERT INTO conversations (owner_id, title, tags, created_at, updated_at)
                 VALUES (?1, ?2, '[]', ?3, ?3)",
                params![owner_id, title, now],
            )?;
            let id = conn.last_insert_rowid();
            load_conversation(conn, id)?.ok_or(StoreError::ConversationNotFound(id))
        })
        .await
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.with_conn(move |conn| load_conversation(conn, id)).await
    }

    async fn get_owned_conversation(
        &self,
        id: ConversationId,
        owner_id: UserId,
    ) -> Result<Option<Conversation>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM conversations WHERE id = ?1 AND owner_id = ?2",
                CONVERSATION_COLUMNS
            );
            conn.query_row(&sql, params![id, owner_id], ConversationRow::from_row)
                .optional()?
                .map(ConversationRow::into_conversation)
                .transpose()
        })
        .await
    }

    async fn list_conversations(&self, owner_id: UserId) -> Result<Vec<Conversation>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM conversations WHERE owner_id = ?1 ORDER BY updated_at DESC, id DESC",
                CONVERSATION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![owner_id], ConversationRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ConversationRow::into_conversation).collect()
        })
        .await
    }

    async fn list_turns(&self, conversation_id: ConversationId) -> Result<Vec<Turn>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, token_count, created_at
                 FROM turns WHERE conversation_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![conversation_id], TurnRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(TurnRow::into_turn).collect()
        })
        .await
    }

    async fn count_turns(&self, conversation_id: ConversationId) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM turns WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn append_turn(&self, conversation_id: ConversationId, turn: NewTurn) -> Result<Turn, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let now_text = timestamp(now);

            if touch(&tx, conversation_id, &now_text)? == 0 {
                return Err(StoreError::ConversationNotFound(conversation_id));
            }
            tx.execute(
                "INSERT INTO turns (conversation_id, role, content, token_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation_id,
                    turn.role.as_str(),
                    turn.content,
                    i64::try_from(turn.token_count).unwrap_or(i64::MAX),
                    now_text
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            debug!("Appended turn {} to conversation {}", id, conversation_id);
            Ok(Turn {
                id,
                conversation_id,
                role: turn.role,
                content: turn.content,
                token_count: turn.token_count,
                created_at: parse_timestamp(&now_text)?,
            })
        })
        .await
    }

    async fn delete_turn(&self, id: TurnId) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM turns WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn delete_conversation(&self, id: ConversationId, owner_id: UserId) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            // Turns go with it through ON DELETE CASCADE
            let deleted = conn.execute(
                "DELETE FROM conversations WHERE id = ?1 AND owner_id = ?2",
                params![id, owner_id],
            )?;
            if deleted > 0 {
                debug!("Deleted conversation {}", id);
            }
            Ok(deleted > 0)
        })
        .await
    }

    async fn set_title(&self, conversation_id: ConversationId, title: &str) -> Result<(), StoreError> {
        let title = title.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, timestamp(Utc::now()), conversation_id],
            )?;
            if updated == 0 {
                return Err(StoreError::ConversationNotFound(conversation_id));
            }
            Ok(())
        })
        .await
    }

    async fn set_digest(
        &self,
        conversation_id: ConversationId,
        summary: &str,
        tags: &[String],
    ) -> Result<(), StoreError> {
        let summary = summary.to_string();
        let tags = if tags.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(tags)
                    .map_err(|e| StoreError::Database(format!("Failed to encode tags: {}", e)))?,
            )
        };
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE conversations
                 SET summary = ?1, tags = COALESCE(?2, tags), updated_at = ?3
                 WHERE id = ?4",
                params![summary, tags, timestamp(Utc::now()), conversation_id],
            )?;
            if updated == 0 {
                return Err(StoreError::ConversationNotFound(conversation_id));
            }
            Ok(())
        })
        .await
    }

    async fn apply_compression(
        &self,
        conversation_id: ConversationId,
        context_summary: &str,
        removed: &[TurnId],
    ) -> Result<(), StoreError> {
        let context_summary = context_summary.to_string();
        let removed = removed.to_vec();
        self.with_conn(move |conn| {
            // Dropping `tx` without commit rolls everything back
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE conversations SET context_summary = ?1, updated_at = ?2 WHERE id = ?3",
                params![context_summary, timestamp(Utc::now()), conversation_id],
            )?;
            if updated == 0 {
                return Err(StoreError::ConversationNotFound(conversation_id));
            }
            {
                let mut delete =
                    tx.prepare("DELETE FROM turns WHERE id = ?1 AND conversation_id = ?2")?;
                for id in &removed {
                    delete.execute(params![id, conversation_id])?;
                }
            }
            tx.commit()?;

            debug!(
                "Compressed conversation {}: removed {} turns",
                conversation_id,
                removed.len()
            );
            Ok(())
        })
        .await
    }
}
