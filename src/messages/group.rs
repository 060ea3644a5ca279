use std::time::Duration;

use crate::clock::millis;
use crate::id::UserId;

use super::model::Message;

/// Run of consecutive messages from one sender, shown under a single header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageGroup<'a> {
    pub sender_id: &'a UserId,
    pub messages: &'a [Message],
}

/// Splits an ordered slice into visual groups. A new group starts when the
/// sender changes or when `gap` or more passed since the previous message.
/// Derived on demand, never stored.
pub fn group_messages(messages: &[Message], gap: Duration) -> Vec<MessageGroup<'_>> {
    let gap = millis(gap);
    let mut groups = Vec::new();
    let mut start = 0;

    for i in 1..=messages.len() {
        let split = match messages.get(i) {
            None => true,
            Some(current) => {
                let previous = &messages[i - 1];
                current.sender_id != previous.sender_id || current.timestamp - previous.timestamp >= gap
            }
        };
        if split {
            groups.push(MessageGroup {
                sender_id: &messages[start].sender_id,
                messages: &messages[start..i],
            });
            start = i;
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::id::{MessageId, RoomId};
    use crate::messages::MessageKind;

    fn at(sender: &str, seq: u64, timestamp: i64) -> Message {
        Message {
            id: MessageId::new(),
            room_id: RoomId::new(),
            seq,
            sender_id: sender.into(),
            sender_name: sender.to_uppercase(),
            kind: MessageKind::Text,
            content: String::new(),
            file_name: None,
            file_size: None,
            timestamp,
            read_by: BTreeSet::new(),
            reply_to: None,
            is_destructive: false,
            destructive_expiry: None,
        }
    }

    const GAP: Duration = Duration::from_secs(300);

    #[test]
    fn empty_log_has_no_groups() {
        assert!(group_messages(&[], GAP).is_empty());
    }

    #[test]
    fn sender_change_and_gap_split_groups() {
        let minute = 60_000;
        let log = vec![
            at("alice", 1, 0),
            at("alice", 2, minute),
            at("bob", 3, 2 * minute),
            at("bob", 4, 7 * minute),
            at("bob", 5, 8 * minute),
        ];
        let sizes: Vec<_> = group_messages(&log, GAP)
            .iter()
            .map(|g| (g.sender_id.as_str(), g.messages.len()))
            .collect();
        assert_eq!(sizes, [("alice", 2), ("bob", 1), ("bob", 2)]);
    }

    #[test]
    fn just_under_the_gap_stays_together() {
        let log = vec![at("a", 1, 0), at("a", 2, 299_999)];
        assert_eq!(group_messages(&log, GAP).len(), 1);
    }
}
