use std::collections::BTreeSet;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{ChatError, ChatResult};
use crate::id::{MessageId, RoomId, UserId};
use crate::messages::{Message, MessageKind, ReplyPreview};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rooms (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        is_temporary INTEGER NOT NULL,
        last_seq INTEGER NOT NULL DEFAULT 0,
        last_timestamp INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS rooms_owner ON rooms (owner_id, is_temporary)",
    "CREATE TABLE IF NOT EXISTS room_participants (
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (room_id, user_id)
    )",
    "CREATE INDEX IF NOT EXISTS participants_user ON room_participants (user_id)",
    "CREATE TABLE IF NOT EXISTS messages (
        room_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        sender_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        file_name TEXT,
        file_size INTEGER,
        timestamp INTEGER NOT NULL,
        reply_to TEXT,
        is_destructive INTEGER NOT NULL,
        destructive_expiry INTEGER,
        client_token TEXT,
        PRIMARY KEY (room_id, seq),
        UNIQUE (room_id, id),
        UNIQUE (room_id, client_token)
    )",
    "CREATE INDEX IF NOT EXISTS messages_expiry ON messages (destructive_expiry)
        WHERE destructive_expiry IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS message_reads (
        room_id TEXT NOT NULL,
        message_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (room_id, message_id, user_id)
    )",
];

pub async fn connect(database_url: &str) -> ChatResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// A private in-memory database. Single connection, otherwise every
/// connection would see its own empty database.
pub async fn connect_in_memory() -> ChatResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Columns added after the first release, for databases created before them.
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("rooms", "last_seq", "INTEGER NOT NULL DEFAULT 0"),
    ("rooms", "last_timestamp", "INTEGER NOT NULL DEFAULT 0"),
];

pub async fn migrate(pool: &SqlitePool) -> ChatResult<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await?;
    }
    for (table, column, decl) in ADDED_COLUMNS {
        let (present,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name=?")
            .bind(*table)
            .bind(*column)
            .fetch_one(pool)
            .await?;
        if present == 0 {
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Highest sequence number and timestamp ever handed out in a room, or
/// `None` if the room does not exist. Survives the deletion of the
/// messages that carried them.
pub async fn room_high_water(pool: &SqlitePool, room_id: RoomId) -> ChatResult<Option<(u64, i64)>> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT MAX(r.last_seq, COALESCE((SELECT MAX(seq) FROM messages WHERE room_id=r.id), 0)),
                MAX(r.last_timestamp, COALESCE((SELECT MAX(timestamp) FROM messages WHERE room_id=r.id), 0))
         FROM rooms r WHERE r.id=?",
    )
    .bind(room_id.to_string())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(seq, ts)| (seq as u64, ts)))
}

/// Removes a room and everything that hangs off it in one transaction.
/// Returns false when the room was already gone.
pub async fn delete_room_cascade(pool: &SqlitePool, room_id: RoomId) -> ChatResult<bool> {
    let room_id = room_id.to_string();
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM message_reads WHERE room_id=?")
        .bind(&room_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM messages WHERE room_id=?")
        .bind(&room_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM room_participants WHERE room_id=?")
        .bind(&room_id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM rooms WHERE id=?")
        .bind(&room_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(deleted > 0)
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RoomRow {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: i64,
    pub is_temporary: bool,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MessageRow {
    pub room_id: String,
    pub seq: i64,
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub kind: String,
    pub content: String,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub timestamp: i64,
    pub reply_to: Option<String>,
    pub is_destructive: bool,
    pub destructive_expiry: Option<i64>,
}

pub(crate) const MESSAGE_COLUMNS: &str = "room_id,seq,id,sender_id,sender_name,kind,content,\
    file_name,file_size,timestamp,reply_to,is_destructive,destructive_expiry";

impl MessageRow {
    pub fn into_message(self, read_by: BTreeSet<UserId>) -> ChatResult<Message> {
        let kind = MessageKind::parse(&self.kind)
            .ok_or_else(|| ChatError::StorageUnavailable(format!("corrupt message kind {}", self.kind)))?;
        let reply_to = match self.reply_to {
            Some(json) => Some(
                serde_json::from_str::<ReplyPreview>(&json)
                    .map_err(|e| ChatError::StorageUnavailable(format!("corrupt reply preview: {e}")))?,
            ),
            None => None,
        };
        let sender_id = UserId::new(self.sender_id);
        let mut read_by = read_by;
        read_by.insert(sender_id.clone());

        Ok(Message {
            id: MessageId::parse(&self.id)?,
            room_id: RoomId::parse(&self.room_id)?,
            seq: self.seq as u64,
            sender_id,
            sender_name: self.sender_name,
            kind,
            content: self.content,
            file_name: self.file_name,
            file_size: self.file_size.map(|s| s as u64),
            timestamp: self.timestamp,
            read_by,
            reply_to,
            is_destructive: self.is_destructive,
            destructive_expiry: self.destructive_expiry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_repeatable() {
        let pool = connect_in_memory().await.unwrap();
        migrate(&pool).await.unwrap();
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rooms")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cascade_on_missing_room_reports_false() {
        let pool = connect_in_memory().await.unwrap();
        assert!(!delete_room_cascade(&pool, RoomId::new()).await.unwrap());
    }
}
