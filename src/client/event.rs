use serde::Serialize;

use crate::id::{MessageId, RoomId, UserId};
use crate::messages::{LogEvent, Message};
use crate::presence::PresenceEvent;

/// Everything a subscriber receives, in one stream. Message events keep
/// log order; presence events may land anywhere between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Message { message: Message },
    Retracted { ids: Vec<MessageId> },
    Read { reader: UserId, ids: Vec<MessageId> },
    Presence(PresenceEvent),
    RoomDeleted { room_id: RoomId },
}

impl From<LogEvent> for ClientEvent {
    fn from(event: LogEvent) -> Self {
        match event {
            LogEvent::Appended { message } => Self::Message { message },
            LogEvent::Retracted { ids } => Self::Retracted { ids },
            LogEvent::Read { reader, ids } => Self::Read { reader, ids },
            LogEvent::RoomDeleted { room_id } => Self::RoomDeleted { room_id },
        }
    }
}

impl From<PresenceEvent> for ClientEvent {
    fn from(event: PresenceEvent) -> Self {
        Self::Presence(event)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;

    #[test]
    fn wire_shape() {
        let room_id = RoomId::new();
        let event = ClientEvent::from(LogEvent::RoomDeleted { room_id });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "room_deleted", "room_id": room_id.to_string() })
        );

        let event = ClientEvent::from(PresenceEvent::ActiveUsers {
            users: BTreeSet::from([UserId::from("a")]),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "presence", "event": "active_users", "users": ["a"] })
        );
    }
}
