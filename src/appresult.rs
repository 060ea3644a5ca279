use axum::{http::StatusCode, response::{IntoResponse, Response}};

use crate::error::ChatError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ChatError::QuotaExceeded { .. }) => StatusCode::CONFLICT,
            Some(ChatError::PermissionDenied(_)) => StatusCode::FORBIDDEN,
            Some(ChatError::StorageUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Some(ChatError::Oversize { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Some(ChatError::InvalidName(_) | ChatError::InvalidMessage(_)) => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self.0, "request failed");
            return (status, format!("{}\n\n{}", self.0, self.0.backtrace())).into_response();
        }

        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_errors_keep_their_status() {
        let err: AppError = ChatError::QuotaExceeded { limit: 2 }.into();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err: AppError = ChatError::NotFound("room".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn foreign_errors_are_internal() {
        let err: AppError = anyhow::anyhow!("boom").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
