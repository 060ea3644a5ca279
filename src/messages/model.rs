use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Millis;
use crate::error::{ChatError, ChatResult};
use crate::id::{MessageId, RoomId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }

    /// Attachment kind guessed from the file extension.
    pub fn for_file_name(name: &str) -> Self {
        let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg" | "heic") => MessageKind::Image,
            _ => MessageKind::File,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of an uploaded blob. The blob URL itself is the message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub file_size: u64,
}

/// Denormalized copy of the message being replied to. Stays valid after the
/// target is deleted or expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: MessageId,
    pub content: String,
    pub sender: String,
    pub kind: MessageKind,
}

impl From<&Message> for ReplyPreview {
    fn from(m: &Message) -> Self {
        Self {
            message_id: m.id,
            content: m.content.clone(),
            sender: m.sender_name.clone(),
            kind: m.kind,
        }
    }
}

/// What a sender hands to the log. Ordering, id and timestamps are never
/// taken from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub sender_id: UserId,
    pub sender_name: String,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub reply_to: Option<ReplyPreview>,
    #[serde(default)]
    pub is_destructive: bool,
    /// Client generated dedup key; a retried append with the same token
    /// resolves to the message stored the first time.
    #[serde(default)]
    pub client_token: Option<String>,
}

impl MessageDraft {
    pub fn text(sender_id: UserId, sender_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            sender_name: sender_name.into(),
            kind: MessageKind::Text,
            content: content.into(),
            attachment: None,
            reply_to: None,
            is_destructive: false,
            client_token: None,
        }
    }

    pub fn attachment(
        sender_id: UserId,
        sender_name: impl Into<String>,
        url: impl Into<String>,
        attachment: Attachment,
    ) -> Self {
        Self {
            sender_id,
            sender_name: sender_name.into(),
            kind: MessageKind::for_file_name(&attachment.file_name),
            content: url.into(),
            attachment: Some(attachment),
            reply_to: None,
            is_destructive: false,
            client_token: None,
        }
    }

    pub fn destructive(mut self) -> Self {
        self.is_destructive = true;
        self
    }

    pub fn replying_to(mut self, preview: ReplyPreview) -> Self {
        self.reply_to = Some(preview);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }

    pub(crate) fn validate(&self) -> ChatResult<()> {
        if self.content.trim().is_empty() {
            return Err(ChatError::InvalidMessage("message is empty".into()));
        }
        match (self.kind, &self.attachment) {
            (MessageKind::Text, Some(_)) => Err(ChatError::InvalidMessage(
                "text messages carry no attachment".into(),
            )),
            (MessageKind::Image | MessageKind::File, None) => Err(ChatError::InvalidMessage(
                format!("{} messages need a file name and size", self.kind),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Active,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    /// Position in the room's log. Strictly increasing, gaps allowed.
    pub seq: u64,
    pub sender_id: UserId,
    pub sender_name: String,
    pub kind: MessageKind,
    pub content: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub timestamp: Millis,
    pub read_by: BTreeSet<UserId>,
    pub reply_to: Option<ReplyPreview>,
    pub is_destructive: bool,
    pub destructive_expiry: Option<Millis>,
}

impl Message {
    pub fn cursor(&self) -> Cursor {
        Cursor { timestamp: self.timestamp, seq: self.seq }
    }

    pub fn state_at(&self, now: Millis) -> MessageState {
        match self.destructive_expiry {
            Some(expiry) if now >= expiry => MessageState::Expired,
            _ => MessageState::Active,
        }
    }

    /// Drives the sender's "seen" tick.
    pub fn is_read_by_others(&self) -> bool {
        self.read_by.iter().any(|reader| *reader != self.sender_id)
    }
}

/// Resume point: the last message a subscriber has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp: Millis,
    pub seq: u64,
}

impl Cursor {
    pub const START: Cursor = Cursor { timestamp: 0, seq: 0 };
}

/// Everything the log publishes to live subscribers of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    Appended { message: Message },
    Retracted { ids: Vec<MessageId> },
    Read { reader: UserId, ids: Vec<MessageId> },
    RoomDeleted { room_id: RoomId },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(expiry: Option<Millis>) -> Message {
        Message {
            id: MessageId::new(),
            room_id: RoomId::new(),
            seq: 1,
            sender_id: "alice".into(),
            sender_name: "Alice".into(),
            kind: MessageKind::Text,
            content: "hi".into(),
            file_name: None,
            file_size: None,
            timestamp: 1_000,
            read_by: BTreeSet::from(["alice".into()]),
            reply_to: None,
            is_destructive: expiry.is_some(),
            destructive_expiry: expiry,
        }
    }

    #[test]
    fn destructive_message_expires_at_deadline() {
        let m = message(Some(11_000));
        assert_eq!(m.state_at(10_999), MessageState::Active);
        assert_eq!(m.state_at(11_000), MessageState::Expired);
        assert_eq!(message(None).state_at(i64::MAX), MessageState::Active);
    }

    #[test]
    fn read_by_others_ignores_sender() {
        let mut m = message(None);
        assert!(!m.is_read_by_others());
        m.read_by.insert("bob".into());
        assert!(m.is_read_by_others());
    }

    #[test]
    fn draft_validation() {
        let ok = MessageDraft::text("a".into(), "A", "hello");
        assert!(ok.validate().is_ok());

        let blank = MessageDraft::text("a".into(), "A", "   ");
        assert!(matches!(blank.validate(), Err(ChatError::InvalidMessage(_))));

        let mut no_meta = MessageDraft::text("a".into(), "A", "https://blob/x.png");
        no_meta.kind = MessageKind::Image;
        assert!(no_meta.validate().is_err());
    }

    #[test]
    fn attachment_kind_follows_extension() {
        assert_eq!(MessageKind::for_file_name("cat.JPG"), MessageKind::Image);
        assert_eq!(MessageKind::for_file_name("notes.pdf"), MessageKind::File);
        assert_eq!(MessageKind::for_file_name("README"), MessageKind::File);
    }

    #[test]
    fn log_event_serializes_with_tag() {
        let ev = LogEvent::Retracted { ids: vec![] };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "retracted");
    }
}
