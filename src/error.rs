//! Core error taxonomy.
//!
//! Every mutation in the core either succeeds or returns one of these; the
//! client session facade decides how each one is shown to a user.

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Room or message does not exist (or was deleted concurrently).
    #[error("no longer available: {0}")]
    NotFound(String),

    #[error("you already own {limit} permanent rooms; delete one or create a temporary room")]
    QuotaExceeded { limit: usize },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Transient storage or blob provider failure. Safe to retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    Oversize { size: usize, limit: usize },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ChatError {
    /// Whether the caller may retry the same action unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::StorageUnavailable(_))
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ChatError::NotFound("row".to_owned()),
            other => {
                tracing::warn!(error = %other, "storage error");
                ChatError::StorageUnavailable(other.to_string())
            }
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::StorageUnavailable(format!("blob provider: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_message_names_the_limit() {
        let err = ChatError::QuotaExceeded { limit: 2 };
        assert!(err.to_string().contains("2 permanent rooms"));
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: ChatError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn closed_pool_maps_to_storage_unavailable() {
        let err: ChatError = sqlx::Error::PoolClosed.into();
        assert!(err.is_transient());
    }

    #[test]
    fn oversize_display() {
        let err = ChatError::Oversize { size: 11, limit: 10 };
        assert_eq!(err.to_string(), "upload of 11 bytes exceeds the 10 byte limit");
    }
}
