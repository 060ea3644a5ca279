use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};
use crate::id::UserId;

/// Who is on the other end of a connection, as told by the session
/// provider. The core only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    pub is_guest: bool,
    pub photo_ref: Option<String>,
}

impl Identity {
    pub fn user(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_guest: false,
            photo_ref: None,
        }
    }

    /// Fresh anonymous identity for someone joining through an invite link.
    pub fn guest(name: &str, photo_ref: Option<String>) -> ChatResult<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidName("guest name is required".into()));
        }
        Ok(Self {
            id: UserId::new_guest(),
            display_name: name.to_owned(),
            is_guest: true,
            photo_ref,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_gets_fresh_prefixed_id() {
        let g = Identity::guest("  Felix ", None).unwrap();
        assert!(g.is_guest);
        assert_eq!(g.display_name, "Felix");
        assert!(g.id.as_str().starts_with("guest_"));
    }

    #[test]
    fn guest_needs_a_name() {
        assert!(matches!(Identity::guest("", None), Err(ChatError::InvalidName(_))));
    }
}
