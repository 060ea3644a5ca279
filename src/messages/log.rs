use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::clock::{Millis, SharedClock, millis};
use crate::config::CoreConfig;
use crate::db::{self, MESSAGE_COLUMNS, MessageRow};
use crate::error::{ChatError, ChatResult};
use crate::id::{MessageId, RoomId, UserId};

use super::feed::{Feed, SlotGuard};
use super::model::{Cursor, LogEvent, Message, MessageDraft};

/// Append-only, per-room ordered message store and its live fan-out.
///
/// The log is the only writer of message order: sequence numbers and
/// timestamps are assigned here, never by clients.
#[derive(Clone)]
pub struct MessageLog {
    pub(super) pool: SqlitePool,
    pub(super) clock: SharedClock,
    pub(super) config: Arc<CoreConfig>,
    feeds: Arc<Mutex<Feeds>>,
}

#[derive(Default)]
struct Feeds {
    open: HashMap<RoomId, Arc<Feed>>,
    /// Deleted rooms and when they were closed.
    closed: HashMap<RoomId, Millis>,
}

enum Stored {
    Inserted,
    DuplicateToken,
}

impl MessageLog {
    pub fn new(pool: SqlitePool, clock: SharedClock, config: Arc<CoreConfig>) -> Self {
        Self {
            pool,
            clock,
            config,
            feeds: Arc::new(Mutex::new(Feeds::default())),
        }
    }

    pub(crate) async fn feed(&self, room_id: RoomId) -> ChatResult<Arc<Feed>> {
        {
            let feeds = self.feeds.lock();
            if let Some(feed) = feeds.open.get(&room_id) {
                return Ok(feed.clone());
            }
            if feeds.closed.contains_key(&room_id) {
                return Err(ChatError::NotFound(format!("room {room_id}")));
            }
        }

        let (last_seq, last_ts) = db::room_high_water(&self.pool, room_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("room {room_id}")))?;

        let mut feeds = self.feeds.lock();
        if feeds.closed.contains_key(&room_id) {
            return Err(ChatError::NotFound(format!("room {room_id}")));
        }
        let feed = feeds.open.entry(room_id).or_insert_with(|| {
            Arc::new(Feed::new(room_id, last_seq, last_ts, self.config.feed_capacity))
        });
        Ok(feed.clone())
    }

    pub(super) fn existing_feed(&self, room_id: RoomId) -> Option<Arc<Feed>> {
        self.feeds.lock().open.get(&room_id).cloned()
    }

    /// Stores a message and publishes it to every live subscriber of the
    /// room, in log order.
    ///
    /// The write runs on its own task: once a sequence number is handed out
    /// the append finishes (or leaves a hole) even if the caller goes away.
    /// A failed write is never published.
    pub async fn append(&self, room_id: RoomId, draft: MessageDraft) -> ChatResult<Message> {
        draft.validate()?;

        if let Some(token) = &draft.client_token {
            if let Some(existing) = self.find_by_token(room_id, token).await? {
                debug!(room_id = %room_id, message_id = %existing.id, "duplicate append resolved by token");
                return Ok(existing);
            }
        }

        let feed = self.feed(room_id).await?;
        let reservation = feed.reserve(self.clock.now_millis())?;

        let destructive_expiry = draft
            .is_destructive
            .then(|| reservation.timestamp + millis(self.config.destructive_ttl));
        let (file_name, file_size) = match draft.attachment {
            Some(a) => (Some(a.file_name), Some(a.file_size)),
            None => (None, None),
        };
        let message = Message {
            id: MessageId::new(),
            room_id,
            seq: reservation.seq,
            read_by: BTreeSet::from([draft.sender_id.clone()]),
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            kind: draft.kind,
            content: draft.content,
            file_name,
            file_size,
            timestamp: reservation.timestamp,
            reply_to: draft.reply_to,
            is_destructive: draft.is_destructive,
            destructive_expiry,
        };
        let token = draft.client_token;

        let pool = self.pool.clone();
        let task_token = token.clone();
        let write = tokio::spawn(async move {
            let slot = SlotGuard::new(&feed, message.seq);
            match insert_message(&pool, &message, task_token.as_deref()).await {
                Ok(Stored::Inserted) => {
                    slot.complete(Some(message.clone()));
                    Ok(Some(message))
                }
                Ok(Stored::DuplicateToken) => {
                    slot.complete(None);
                    Ok(None)
                }
                Err(e) => {
                    slot.complete(None);
                    Err(e)
                }
            }
        });

        let outcome = write
            .await
            .map_err(|e| ChatError::StorageUnavailable(format!("append task failed: {e}")))?;
        match outcome {
            Ok(Some(message)) => {
                debug!(room_id = %room_id, seq = message.seq, "message appended");
                Ok(message)
            }
            Ok(None) => {
                let token = token.unwrap_or_default();
                self.find_by_token(room_id, &token)
                    .await?
                    .ok_or_else(|| ChatError::NotFound(format!("message with token {token}")))
            }
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "append failed");
                Err(e)
            }
        }
    }

    /// Adds `reader` to `read_by` of each listed message it did not author.
    /// Per-message idempotent; unknown ids are skipped. Returns the ids that
    /// gained a receipt.
    pub async fn mark_read(
        &self,
        room_id: RoomId,
        ids: &[MessageId],
        reader: &UserId,
    ) -> ChatResult<Vec<MessageId>> {
        let room_key = room_id.to_string();
        let mut seen = HashSet::new();
        let mut marked = Vec::new();
        let mut failure = None;

        for id in ids.iter().filter(|id| seen.insert(**id)) {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO message_reads (room_id,message_id,user_id)
                 SELECT room_id,id,? FROM messages WHERE room_id=? AND id=? AND sender_id<>?",
            )
            .bind(reader.as_str())
            .bind(&room_key)
            .bind(id.to_string())
            .bind(reader.as_str())
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => marked.push(*id),
                Ok(_) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if !marked.is_empty() {
            if let Some(feed) = self.existing_feed(room_id) {
                feed.publish(LogEvent::Read { reader: reader.clone(), ids: marked.clone() });
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(marked),
        }
    }

    /// Messages after `cursor`, oldest first, without expired ones.
    pub async fn history(&self, room_id: RoomId, cursor: Cursor) -> ChatResult<Vec<Message>> {
        self.fetch_range(room_id, cursor.seq, None).await
    }

    /// Active messages with `after < seq < before`.
    pub(super) async fn fetch_range(
        &self,
        room_id: RoomId,
        after: u64,
        before: Option<u64>,
    ) -> ChatResult<Vec<Message>> {
        let before = before.map(|b| b as i64).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? AND seq>? AND seq<? ORDER BY seq"
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(room_id.to_string())
            .bind(after as i64)
            .bind(before)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate(room_id, rows).await
    }

    pub async fn get(&self, room_id: RoomId, id: MessageId) -> ChatResult<Message> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? AND id=?");
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(room_id.to_string())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let rows = row.into_iter().collect();
        self.hydrate(room_id, rows)
            .await?
            .pop()
            .ok_or_else(|| ChatError::NotFound(format!("message {id}")))
    }

    /// Newest active message, used for room summaries.
    pub async fn last(&self, room_id: RoomId) -> ChatResult<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=?
             AND (destructive_expiry IS NULL OR destructive_expiry>?) ORDER BY seq DESC LIMIT 1"
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(room_id.to_string())
            .bind(self.clock.now_millis())
            .fetch_all(&self.pool)
            .await?;
        Ok(self.hydrate(room_id, rows).await?.pop())
    }

    async fn find_by_token(&self, room_id: RoomId, token: &str) -> ChatResult<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id=? AND client_token=?");
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(room_id.to_string())
            .bind(token)
            .fetch_all(&self.pool)
            .await?;
        Ok(self.hydrate(room_id, rows).await?.pop())
    }

    /// Attaches read receipts and drops anything past its destructive expiry.
    async fn hydrate(&self, room_id: RoomId, rows: Vec<MessageRow>) -> ChatResult<Vec<Message>> {
        let now = self.clock.now_millis();
        let rows: Vec<MessageRow> = rows
            .into_iter()
            .filter(|row| row.destructive_expiry.is_none_or(|expiry| now < expiry))
            .collect();
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Ok(Vec::new());
        };

        let reads: Vec<(String, String)> = sqlx::query_as(
            "SELECT r.message_id, r.user_id FROM message_reads r
             JOIN messages m ON m.room_id=r.room_id AND m.id=r.message_id
             WHERE r.room_id=? AND m.seq BETWEEN ? AND ?",
        )
        .bind(room_id.to_string())
        .bind(first.seq)
        .bind(last.seq)
        .fetch_all(&self.pool)
        .await?;

        let mut by_message: HashMap<String, BTreeSet<UserId>> = HashMap::new();
        for (message_id, user_id) in reads {
            by_message.entry(message_id).or_default().insert(UserId::new(user_id));
        }

        rows.into_iter()
            .map(|row| {
                let read_by = by_message.remove(&row.id).unwrap_or_default();
                row.into_message(read_by)
            })
            .collect()
    }

    /// Ends every live subscription of a room with `RoomDeleted`. Called by
    /// the lifecycle manager after the cascade has hit storage.
    pub fn close_room(&self, room_id: RoomId) {
        let now = self.clock.now_millis();
        let feed = {
            let mut feeds = self.feeds.lock();
            feeds.closed.insert(room_id, now);
            feeds.open.remove(&room_id)
        };
        if let Some(feed) = feed {
            info!(room_id = %room_id, subscribers = feed.subscriber_count(), "closing room feed");
            feed.close();
        }
    }

    /// Forgets rooms closed before `cutoff`; `feed` then finds them missing
    /// in storage instead.
    pub(crate) fn prune_closed(&self, cutoff: Millis) -> usize {
        let mut feeds = self.feeds.lock();
        let before = feeds.closed.len();
        feeds.closed.retain(|_, closed_at| *closed_at > cutoff);
        before - feeds.closed.len()
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> (usize, usize) {
        let feeds = self.feeds.lock();
        (feeds.open.len(), feeds.closed.len())
    }
}

async fn insert_message(pool: &SqlitePool, message: &Message, token: Option<&str>) -> ChatResult<Stored> {
    let reply_to = match &message.reply_to {
        Some(preview) => Some(
            serde_json::to_string(preview).map_err(|e| ChatError::InvalidMessage(e.to_string()))?,
        ),
        None => None,
    };
    let room_key = message.room_id.to_string();
    let id = message.id.to_string();

    let mut tx = pool.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO messages (room_id,seq,id,sender_id,sender_name,kind,content,file_name,file_size,
            timestamp,reply_to,is_destructive,destructive_expiry,client_token)
         SELECT ?,?,?,?,?,?,?,?,?,?,?,?,?,? WHERE EXISTS (SELECT 1 FROM rooms WHERE id=?)",
    )
    .bind(&room_key)
    .bind(message.seq as i64)
    .bind(&id)
    .bind(message.sender_id.as_str())
    .bind(&message.sender_name)
    .bind(message.kind.as_str())
    .bind(&message.content)
    .bind(&message.file_name)
    .bind(message.file_size.map(|s| s as i64))
    .bind(message.timestamp)
    .bind(reply_to)
    .bind(message.is_destructive)
    .bind(message.destructive_expiry)
    .bind(token)
    .bind(&room_key)
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(done) if done.rows_affected() == 0 => {
            return Err(ChatError::NotFound(format!("room {}", message.room_id)));
        }
        Ok(_) => {}
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() && token.is_some() => {
            return Ok(Stored::DuplicateToken);
        }
        Err(e) => return Err(e.into()),
    }

    sqlx::query("INSERT OR IGNORE INTO message_reads (room_id,message_id,user_id) VALUES (?,?,?)")
        .bind(&room_key)
        .bind(&id)
        .bind(message.sender_id.as_str())
        .execute(&mut *tx)
        .await?;
    // Expiry deletes rows; the room keeps the high-water mark so a restarted
    // feed never hands out a sequence number twice.
    sqlx::query("UPDATE rooms SET last_seq=MAX(last_seq,?), last_timestamp=MAX(last_timestamp,?) WHERE id=?")
        .bind(message.seq as i64)
        .bind(message.timestamp)
        .bind(&room_key)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Stored::Inserted)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db;

    async fn setup() -> (MessageLog, Arc<ManualClock>, RoomId) {
        let pool = db::connect_in_memory().await.unwrap();
        let room_id = RoomId::new();
        sqlx::query("INSERT INTO rooms (id,name,owner_id,created_at,is_temporary) VALUES (?,?,?,?,?)")
            .bind(room_id.to_string())
            .bind("lobby")
            .bind("alice")
            .bind(0_i64)
            .bind(false)
            .execute(&pool)
            .await
            .unwrap();
        let clock = ManualClock::new(1_000);
        let log = MessageLog::new(pool, clock.clone(), Arc::new(CoreConfig::default()));
        (log, clock, room_id)
    }

    #[tokio::test]
    async fn append_assigns_order_and_sender_receipt() {
        let (log, clock, room) = setup().await;
        let a = log.append(room, MessageDraft::text("alice".into(), "Alice", "one")).await.unwrap();
        clock.advance(Duration::from_millis(5));
        let b = log.append(room, MessageDraft::text("bob".into(), "Bob", "two")).await.unwrap();

        assert!(a.seq < b.seq);
        assert!(a.timestamp <= b.timestamp);
        assert_eq!(a.read_by, BTreeSet::from(["alice".into()]));

        let history = log.history(room, Cursor::START).await.unwrap();
        assert_eq!(history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["one", "two"]);
        assert_eq!(log.history(room, a.cursor()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_to_missing_room_is_not_found() {
        let (log, _, _) = setup().await;
        let err = log
            .append(RoomId::new(), MessageDraft::text("a".into(), "A", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn retried_append_with_token_is_stored_once() {
        let (log, _, room) = setup().await;
        let draft = MessageDraft::text("alice".into(), "Alice", "hello").with_token("tok-1");
        let first = log.append(room, draft.clone()).await.unwrap();
        let second = log.append(room, draft).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(log.history(room, Cursor::START).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_read_skips_author_and_is_idempotent() {
        let (log, _, room) = setup().await;
        let m = log.append(room, MessageDraft::text("alice".into(), "Alice", "hi")).await.unwrap();

        assert!(log.mark_read(room, &[m.id], &"alice".into()).await.unwrap().is_empty());
        assert_eq!(log.mark_read(room, &[m.id, m.id], &"bob".into()).await.unwrap(), vec![m.id]);
        assert!(log.mark_read(room, &[m.id], &"bob".into()).await.unwrap().is_empty());

        let stored = log.get(room, m.id).await.unwrap();
        assert_eq!(stored.read_by, BTreeSet::from(["alice".into(), "bob".into()]));
        assert!(stored.is_read_by_others());
    }

    #[tokio::test]
    async fn storage_failure_is_reported_and_nothing_is_published() {
        let (log, _, room) = setup().await;
        log.append(room, MessageDraft::text("a".into(), "A", "warm up")).await.unwrap();
        let feed = log.feed(room).await.unwrap();
        let (mut rx, _) = feed.watch().unwrap();

        log.pool.close().await;
        let err = log
            .append(room, MessageDraft::text("a".into(), "A", "lost?"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restarted_log_never_reuses_expired_sequence_numbers() {
        let (log, clock, room) = setup().await;
        log.append(room, MessageDraft::text("a".into(), "A", "one")).await.unwrap();
        let burn = log
            .append(room, MessageDraft::text("a".into(), "A", "burn").destructive())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(11));
        assert_eq!(log.expire_destructive(room).await.unwrap(), vec![burn.id]);

        let restarted = MessageLog::new(log.pool.clone(), clock.clone(), Arc::new(CoreConfig::default()));
        let after = restarted
            .append(room, MessageDraft::text("a".into(), "A", "after restart"))
            .await
            .unwrap();
        assert!(after.seq > burn.seq);
        assert!(after.timestamp >= burn.timestamp);

        // A client that saw "burn" before it expired resumes from its cursor.
        let resumed = restarted.history(room, burn.cursor()).await.unwrap();
        assert_eq!(resumed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![after.id]);
    }

    #[tokio::test]
    async fn expired_messages_are_hidden_from_reads() {
        let (log, clock, room) = setup().await;
        let m = log
            .append(room, MessageDraft::text("a".into(), "A", "boom").destructive())
            .await
            .unwrap();
        assert_eq!(m.destructive_expiry, Some(m.timestamp + 10_000));
        assert!(log.last(room).await.unwrap().is_some());

        clock.advance(Duration::from_secs(10));
        assert!(log.history(room, Cursor::START).await.unwrap().is_empty());
        assert!(matches!(log.get(room, m.id).await, Err(ChatError::NotFound(_))));
        assert!(log.last(room).await.unwrap().is_none());
    }
}
