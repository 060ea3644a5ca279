//! Authoritative deletion of destructive messages.
//!
//! Readers already hide expired messages; the sweep removes them from
//! storage and tells live subscribers to drop what they rendered.

use tracing::debug;

use crate::error::ChatResult;
use crate::id::{MessageId, RoomId};

use super::log::MessageLog;
use super::model::LogEvent;

impl MessageLog {
    /// Deletes every message in the room whose destructive expiry has passed
    /// and publishes one retraction for them.
    pub async fn expire_destructive(&self, room_id: RoomId) -> ChatResult<Vec<MessageId>> {
        let now = self.clock.now_millis();
        let room_key = room_id.to_string();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM message_reads WHERE room_id=? AND message_id IN
                (SELECT id FROM messages WHERE room_id=? AND destructive_expiry IS NOT NULL AND destructive_expiry<=?)",
        )
        .bind(&room_key)
        .bind(&room_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let removed: Vec<(String,)> = sqlx::query_as(
            "DELETE FROM messages WHERE room_id=? AND destructive_expiry IS NOT NULL AND destructive_expiry<=?
             RETURNING id",
        )
        .bind(&room_key)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let ids = removed
            .into_iter()
            .map(|(id,)| MessageId::parse(&id))
            .collect::<ChatResult<Vec<_>>>()?;

        if !ids.is_empty() {
            debug!(room_id = %room_id, count = ids.len(), "destructive messages expired");
            if let Some(feed) = self.existing_feed(room_id) {
                feed.publish(LogEvent::Retracted { ids: ids.clone() });
            }
        }
        Ok(ids)
    }

    /// One sweep over every room with due messages. Returns how many
    /// messages were removed.
    pub async fn expire_all_destructive(&self) -> ChatResult<usize> {
        let due: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT room_id FROM messages WHERE destructive_expiry IS NOT NULL AND destructive_expiry<=?",
        )
        .bind(self.clock.now_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0;
        for (room,) in due {
            removed += self.expire_destructive(RoomId::parse(&room)?).await?.len();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CoreConfig;
    use crate::db;
    use crate::messages::{Cursor, MessageDraft};

    #[tokio::test]
    async fn sweep_deletes_and_retracts() {
        let pool = db::connect_in_memory().await.unwrap();
        let room = RoomId::new();
        sqlx::query("INSERT INTO rooms (id,name,owner_id,created_at,is_temporary) VALUES (?,'r','o',0,0)")
            .bind(room.to_string())
            .execute(&pool)
            .await
            .unwrap();
        let clock = ManualClock::new(0);
        let log = MessageLog::new(pool.clone(), clock.clone(), Arc::new(CoreConfig::default()));

        let keep = log.append(room, MessageDraft::text("a".into(), "A", "stay")).await.unwrap();
        let burn = log
            .append(room, MessageDraft::text("a".into(), "A", "burn").destructive())
            .await
            .unwrap();
        log.mark_read(room, &[burn.id], &"b".into()).await.unwrap();

        let mut stream = log.stream_since(room, Cursor::START).await.unwrap();
        stream.next().await.unwrap();
        stream.next().await.unwrap();

        assert!(log.expire_destructive(room).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(10));
        assert_eq!(log.expire_all_destructive().await.unwrap(), 1);
        assert_eq!(stream.next().await, Some(LogEvent::Retracted { ids: vec![burn.id] }));

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        let (reads,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM message_reads WHERE message_id=?")
            .bind(burn.id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(reads, 0);
        assert_eq!(log.get(room, keep.id).await.unwrap().content, "stay");
    }
}
