use crate::models::{ChatId, MessageId, UserId};
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("chat {0} not found")]
    ChatNotFound(ChatId),

    #[error("message {message_id} not found in chat {chat_id}")]
    MessageNotFound {
        chat_id: ChatId,
        message_id: MessageId,
    },

    #[error("user {user_id} is not a participant of chat {chat_id}")]
    NotAParticipant { chat_id: ChatId, user_id: UserId },

    #[error("cursor {cursor} is ahead of chat {chat_id} (latest message {latest})")]
    InvalidCursor {
        chat_id: ChatId,
        cursor: MessageId,
        latest: MessageId,
    },

    #[error("too many sync requests")]
    RateLimited,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal server error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
    message: String,
}

impl AppError {
    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::StartServer(_) => "start_server",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::ChatNotFound(_) => "chat_not_found",
            AppError::MessageNotFound { .. } => "message_not_found",
            AppError::NotAParticipant { .. } => "not_a_participant",
            AppError::InvalidCursor { .. } => "invalid_cursor",
            AppError::RateLimited => "rate_limited",
            AppError::StorageUnavailable(_) => "storage_unavailable",
            AppError::Internal => "internal",
        }
    }

    /// Transient errors a caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::StorageUnavailable(_) | AppError::RateLimited)
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::NotAParticipant { .. } => StatusCode::FORBIDDEN,
            AppError::ChatNotFound(_) | AppError::MessageNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::InvalidCursor { .. } => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }
        HttpResponse::build(status).json(ErrorBody {
            success: false,
            error: self.code(),
            message: self.to_string(),
        })
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::StorageUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::ChatNotFound(1).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::NotAParticipant {
                chat_id: 1,
                user_id: 2
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AppError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AppError::StorageUnavailable("disk".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::StorageUnavailable("x".into()).is_retryable());
        assert!(AppError::RateLimited.is_retryable());
        assert!(!AppError::InvalidCursor {
            chat_id: 1,
            cursor: 9,
            latest: 2
        }
        .is_retryable());
        assert!(!AppError::ChatNotFound(3).is_retryable());
        assert!(!AppError::Forbidden.is_retryable());
    }
}
