use std::collections::VecDeque;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::id::RoomId;

use super::log::MessageLog;
use super::model::{Cursor, LogEvent, Message, MessageState};

pub type LogStream = BoxStream<'static, LogEvent>;

/// Replay-then-live reader over one room's log.
struct Tail {
    log: MessageLog,
    room_id: RoomId,
    cursor: Cursor,
    backlog: VecDeque<Message>,
    rx: broadcast::Receiver<LogEvent>,
    finished: bool,
}

impl Tail {
    async fn open(log: MessageLog, room_id: RoomId, cursor: Cursor) -> ChatResult<Self> {
        let (rx, backlog) = Self::catch_up(&log, room_id, cursor).await?;
        Ok(Self { log, room_id, cursor, backlog, rx, finished: false })
    }

    /// Subscribing before reading storage, bounded by the watermark, means
    /// every message lands exactly once: below the watermark from storage,
    /// at or above it from the live channel.
    async fn catch_up(
        log: &MessageLog,
        room_id: RoomId,
        cursor: Cursor,
    ) -> ChatResult<(broadcast::Receiver<LogEvent>, VecDeque<Message>)> {
        let feed = log.feed(room_id).await?;
        let (rx, watermark) = feed.watch()?;
        let backlog = log.fetch_range(room_id, cursor.seq, Some(watermark)).await?;
        debug!(room_id = %room_id, replay = backlog.len(), after_seq = cursor.seq, "log stream opened");
        Ok((rx, backlog.into()))
    }

    fn is_live(&self, message: &Message) -> bool {
        message.seq > self.cursor.seq
            && message.state_at(self.log.clock.now_millis()) == MessageState::Active
    }

    async fn next(&mut self) -> Option<LogEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(message) = self.backlog.pop_front() {
                self.cursor = message.cursor();
                return Some(LogEvent::Appended { message });
            }

            match self.rx.recv().await {
                Ok(LogEvent::Appended { message }) => {
                    if !self.is_live(&message) {
                        continue;
                    }
                    self.cursor = message.cursor();
                    return Some(LogEvent::Appended { message });
                }
                Ok(event @ LogEvent::RoomDeleted { .. }) => {
                    self.finished = true;
                    return Some(event);
                }
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(room_id = %self.room_id, skipped, "subscriber lagged, catching up from storage");
                    match Self::catch_up(&self.log, self.room_id, self.cursor).await {
                        Ok((rx, backlog)) => {
                            self.rx = rx;
                            self.backlog = backlog;
                        }
                        Err(ChatError::NotFound(_)) => {
                            self.finished = true;
                            return Some(LogEvent::RoomDeleted { room_id: self.room_id });
                        }
                        Err(e) => {
                            // Ends the stream; the subscriber resumes from its cursor.
                            warn!(room_id = %self.room_id, error = %e, "catch-up failed");
                            self.finished = true;
                            return None;
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return Some(LogEvent::RoomDeleted { room_id: self.room_id });
                }
            }
        }
    }
}

impl MessageLog {
    /// Messages after `cursor` in log order, then the live tail of the room:
    /// new messages, retractions, receipts and finally `RoomDeleted`.
    ///
    /// Expired destructive messages are never yielded, whether they come
    /// from storage or from the live channel.
    pub async fn stream_since(&self, room_id: RoomId, cursor: Cursor) -> ChatResult<LogStream> {
        let tail = Tail::open(self.clone(), room_id, cursor).await?;
        Ok(stream::unfold(tail, |mut tail| async move {
            let event = tail.next().await?;
            Some((event, tail))
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CoreConfig;
    use crate::db;
    use crate::messages::MessageDraft;

    async fn setup(capacity: usize) -> (MessageLog, Arc<ManualClock>, RoomId) {
        let pool = db::connect_in_memory().await.unwrap();
        let room_id = RoomId::new();
        sqlx::query("INSERT INTO rooms (id,name,owner_id,created_at,is_temporary) VALUES (?,'r','o',0,1)")
            .bind(room_id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        let clock = ManualClock::new(0);
        let config = CoreConfig { feed_capacity: capacity, ..CoreConfig::default() };
        (MessageLog::new(pool, clock.clone(), Arc::new(config)), clock, room_id)
    }

    fn content(event: &LogEvent) -> &str {
        match event {
            LogEvent::Appended { message } => &message.content,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replays_history_then_follows_live() {
        let (log, _, room) = setup(16).await;
        log.append(room, MessageDraft::text("a".into(), "A", "old")).await.unwrap();

        let mut stream = log.stream_since(room, Cursor::START).await.unwrap();
        assert_eq!(content(&stream.next().await.unwrap()), "old");

        log.append(room, MessageDraft::text("b".into(), "B", "new")).await.unwrap();
        assert_eq!(content(&stream.next().await.unwrap()), "new");
    }

    #[tokio::test]
    async fn resume_skips_what_was_seen() {
        let (log, _, room) = setup(16).await;
        let first = log.append(room, MessageDraft::text("a".into(), "A", "1")).await.unwrap();
        log.append(room, MessageDraft::text("a".into(), "A", "2")).await.unwrap();

        let mut stream = log.stream_since(room, first.cursor()).await.unwrap();
        assert_eq!(content(&stream.next().await.unwrap()), "2");
    }

    #[tokio::test]
    async fn lagging_subscriber_recovers_without_gaps() {
        let (log, _, room) = setup(2).await;
        let mut stream = log.stream_since(room, Cursor::START).await.unwrap();
        for i in 0..6 {
            log.append(room, MessageDraft::text("a".into(), "A", i.to_string())).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(content(&stream.next().await.unwrap()).to_owned());
        }
        assert_eq!(seen, ["0", "1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn expired_message_is_not_replayed() {
        let (log, clock, room) = setup(16).await;
        log.append(room, MessageDraft::text("a".into(), "A", "secret").destructive()).await.unwrap();
        log.append(room, MessageDraft::text("a".into(), "A", "plain")).await.unwrap();

        clock.advance(Duration::from_secs(11));
        let mut stream = log.stream_since(room, Cursor::START).await.unwrap();
        assert_eq!(content(&stream.next().await.unwrap()), "plain");
    }

    #[tokio::test]
    async fn closing_room_ends_stream() {
        let (log, _, room) = setup(16).await;
        let mut stream = log.stream_since(room, Cursor::START).await.unwrap();
        log.close_room(room);
        assert_eq!(stream.next().await, Some(LogEvent::RoomDeleted { room_id: room }));
        assert_eq!(stream.next().await, None);
        assert!(log.stream_since(room, Cursor::START).await.is_err());
    }
}
