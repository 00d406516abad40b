use async_trait::async_trait;
use parley_protocol::{ChatMessage, DeliveryState, GroupId, Identity, MessageType, Target};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Task(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Errors worth retrying: a busy/locked database or a failed blocking task.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Task(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// A message row together with its tombstone flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message: ChatMessage,
    pub deleted: bool,
}

/// Request/response data store the relay consults. Never called while an
/// in-memory lock is held.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Record that an identity has been seen. Idempotent.
    async fn register_identity(&self, identity: &str) -> Result<(), StoreError>;

    async fn identity_exists(&self, identity: &str) -> Result<bool, StoreError>;

    /// Insert a message. Re-inserting the same id is a no-op, so callers may retry.
    async fn create_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<StoredMessage>, StoreError>;

    /// Advance the delivery state; never moves backwards. Returns the state
    /// stored after the call.
    async fn set_delivery_state(
        &self,
        message_id: &str,
        state: DeliveryState,
    ) -> Result<DeliveryState, StoreError>;

    /// Tombstone (`hard = false`) or remove (`hard = true`) a message.
    async fn delete_message(&self, message_id: &str, hard: bool) -> Result<(), StoreError>;

    /// Participants of a group, or `None` if the group does not exist.
    async fn group_participants(
        &self,
        group_id: &str,
    ) -> Result<Option<Vec<Identity>>, StoreError>;

    async fn user_groups(&self, identity: &str) -> Result<Vec<GroupId>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY NOT NULL,
    display_name  TEXT,
    created_at    TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS chat_groups (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS group_members (
    group_id  TEXT NOT NULL REFERENCES chat_groups(id) ON DELETE CASCADE,
    user_id   TEXT NOT NULL,
    PRIMARY KEY (group_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    sender_id       TEXT NOT NULL,
    target_kind     TEXT NOT NULL,
    target_id       TEXT NOT NULL,
    content         TEXT NOT NULL,
    message_type    TEXT NOT NULL,
    created_at_ms   INTEGER NOT NULL,
    delivery_state  INTEGER NOT NULL DEFAULT 0,
    reply_to        TEXT,
    forwarded_from  TEXT,
    deleted         INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_target ON messages(target_kind, target_id);
";

fn state_rank(state: DeliveryState) -> i64 {
    match state {
        DeliveryState::Sent => 0,
        DeliveryState::Delivered => 1,
        DeliveryState::Read => 2,
    }
}

fn state_from_rank(rank: i64) -> Result<DeliveryState, StoreError> {
    match rank {
        0 => Ok(DeliveryState::Sent),
        1 => Ok(DeliveryState::Delivered),
        2 => Ok(DeliveryState::Read),
        other => Err(StoreError::Corrupt(format!("delivery_state {other}"))),
    }
}

fn target_columns(target: &Target) -> (&'static str, &str) {
    match target {
        Target::Peer(id) => ("peer", id),
        Target::Group(id) => ("group", id),
    }
}

struct MessageRow {
    id: String,
    sender_id: String,
    target_kind: String,
    target_id: String,
    content: String,
    message_type: String,
    created_at_ms: i64,
    delivery_state: i64,
    reply_to: Option<String>,
    forwarded_from: Option<String>,
    deleted: bool,
}

impl MessageRow {
    fn into_stored(self) -> Result<StoredMessage, StoreError> {
        let target = match self.target_kind.as_str() {
            "peer" => Target::Peer(self.target_id),
            "group" => Target::Group(self.target_id),
            other => return Err(StoreError::Corrupt(format!("target_kind {other}"))),
        };
        let message_type: MessageType = self.message_type.parse().map_err(StoreError::Corrupt)?;
        Ok(StoredMessage {
            message: ChatMessage {
                id: self.id,
                sender_id: self.sender_id,
                target,
                content: self.content,
                message_type,
                created_at_ms: self.created_at_ms.max(0) as u64,
                delivery_state: state_from_rank(self.delivery_state)?,
                reply_to: self.reply_to,
                forwarded_from: self.forwarded_from,
            },
            deleted: self.deleted,
        })
    }
}

/// SQLite-backed store.
///
/// The connection lives behind a `std::sync::Mutex` and every query runs on
/// `spawn_blocking`, so synchronous SQLite I/O never stalls the runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStore {
    /// Open the database at `path`, or an in-memory database when `None`.
    /// A file that cannot be opened falls back to in-memory with an error log.
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                match Connection::open(path) {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(?e, path = %path.display(), "failed to open db, falling back to in-memory");
                        Connection::open_in_memory()?
                    }
                }
            }
            None => Connection::open_in_memory()?,
        };

        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.busy_timeout(Duration::from_millis(250))?;
        conn.execute_batch(SCHEMA)?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap_or(0);
        if count > 0 {
            tracing::info!(count, "loaded message store from disk");
        }

        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(None)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Task(format!("lock poisoned: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {e}")))?
    }

    pub async fn create_user(&self, id: &str, display_name: &str) -> Result<(), StoreError> {
        let (id, display_name) = (id.to_string(), display_name.to_string());
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (id, display_name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
                params![id, display_name],
            )?;
            Ok(())
        })
        .await
    }

    /// Create a group with its initial participants. Unknown participants are
    /// registered as users.
    pub async fn create_group(
        &self,
        id: &str,
        name: &str,
        participants: &[Identity],
    ) -> Result<(), StoreError> {
        let (id, name) = (id.to_string(), name.to_string());
        let participants = participants.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chat_groups (id, name) VALUES (?1, ?2)",
                params![id, name],
            )?;
            for user in &participants {
                tx.execute("INSERT OR IGNORE INTO users (id) VALUES (?1)", [user])?;
                tx.execute(
                    "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                    params![id, user],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn add_participant(&self, group_id: &str, user: &str) -> Result<(), StoreError> {
        let (group_id, user) = (group_id.to_string(), user.to_string());
        self.blocking(move |conn| {
            if !group_exists(conn, &group_id)? {
                return Err(StoreError::NotFound(format!("group {group_id}")));
            }
            conn.execute("INSERT OR IGNORE INTO users (id) VALUES (?1)", [&user])?;
            conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![group_id, user],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn remove_participant(&self, group_id: &str, user: &str) -> Result<(), StoreError> {
        let (group_id, user) = (group_id.to_string(), user.to_string());
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user],
            )?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!(
                    "participant {user} of group {group_id}"
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_group(&self, group_id: &str) -> Result<(), StoreError> {
        let group_id = group_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM group_members WHERE group_id = ?1", [&group_id])?;
            let removed = tx.execute("DELETE FROM chat_groups WHERE id = ?1", [&group_id])?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!("group {group_id}")));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn group_exists(conn: &Connection, group_id: &str) -> Result<bool, StoreError> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM chat_groups WHERE id = ?1)",
        [group_id],
        |row| row.get(0),
    )?)
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn register_identity(&self, identity: &str) -> Result<(), StoreError> {
        let identity = identity.to_string();
        self.blocking(move |conn| {
            conn.execute("INSERT OR IGNORE INTO users (id) VALUES (?1)", [&identity])?;
            Ok(())
        })
        .await
    }

    async fn identity_exists(&self, identity: &str) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        self.blocking(move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                [&identity],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn create_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let message = message.clone();
        self.blocking(move |conn| {
            let (target_kind, target_id) = target_columns(&message.target);
            conn.execute(
                "INSERT OR IGNORE INTO messages
                    (id, sender_id, target_kind, target_id, content, message_type,
                     created_at_ms, delivery_state, reply_to, forwarded_from)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.id,
                    message.sender_id,
                    target_kind,
                    target_id,
                    message.content,
                    message.message_type.as_str(),
                    message.created_at_ms as i64,
                    state_rank(message.delivery_state),
                    message.reply_to,
                    message.forwarded_from,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<StoredMessage>, StoreError> {
        let message_id = message_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, sender_id, target_kind, target_id, content, message_type,
                            created_at_ms, delivery_state, reply_to, forwarded_from, deleted
                     FROM messages WHERE id = ?1",
                    [&message_id],
                    |row| {
                        Ok(MessageRow {
                            id: row.get(0)?,
                            sender_id: row.get(1)?,
                            target_kind: row.get(2)?,
                            target_id: row.get(3)?,
                            content: row.get(4)?,
                            message_type: row.get(5)?,
                            created_at_ms: row.get(6)?,
                            delivery_state: row.get(7)?,
                            reply_to: row.get(8)?,
                            forwarded_from: row.get(9)?,
                            deleted: row.get(10)?,
                        })
                    },
                )
                .optional()?;
            row.map(MessageRow::into_stored).transpose()
        })
        .await
    }

    async fn set_delivery_state(
        &self,
        message_id: &str,
        state: DeliveryState,
    ) -> Result<DeliveryState, StoreError> {
        let message_id = message_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE messages SET delivery_state = ?2
                 WHERE id = ?1 AND delivery_state < ?2",
                params![message_id, state_rank(state)],
            )?;
            let rank: Option<i64> = conn
                .query_row(
                    "SELECT delivery_state FROM messages WHERE id = ?1",
                    [&message_id],
                    |row| row.get(0),
                )
                .optional()?;
            match rank {
                Some(rank) => state_from_rank(rank),
                None => Err(StoreError::NotFound(format!("message {message_id}"))),
            }
        })
        .await
    }

    async fn delete_message(&self, message_id: &str, hard: bool) -> Result<(), StoreError> {
        let message_id = message_id.to_string();
        self.blocking(move |conn| {
            let affected = if hard {
                conn.execute("DELETE FROM messages WHERE id = ?1", [&message_id])?
            } else {
                conn.execute(
                    "UPDATE messages SET deleted = 1, content = '' WHERE id = ?1",
                    [&message_id],
                )?
            };
            if affected == 0 {
                return Err(StoreError::NotFound(format!("message {message_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn group_participants(
        &self,
        group_id: &str,
    ) -> Result<Option<Vec<Identity>>, StoreError> {
        let group_id = group_id.to_string();
        self.blocking(move |conn| {
            if !group_exists(conn, &group_id)? {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id",
            )?;
            let members = stmt
                .query_map([&group_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(Some(members))
        })
        .await
    }

    async fn user_groups(&self, identity: &str) -> Result<Vec<GroupId>, StoreError> {
        let identity = identity.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY group_id",
            )?;
            let groups = stmt
                .query_map([&identity], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(groups)
        })
        .await
    }
}

/// Bounded retry with exponential backoff for transient store errors.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(op, attempt, ?delay, error = %e, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
