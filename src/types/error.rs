//! Error types for Postern

use hyper::StatusCode;
use std::time::Duration;

/// Main error type for Postern operations
#[derive(Debug, thiserror::Error)]
pub enum PosternError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Missing user")]
    MissingUser,

    #[error("Session not found for user {0}")]
    SessionNotFound(String),

    #[error("Session already exists for user {0}")]
    AlreadyExists(String),

    #[error("Session is already logged in and connected")]
    AlreadyLoggedIn,

    #[error("Session is not logged in")]
    NotLoggedIn,

    #[error("Message cooldown active, retry after {} seconds", .retry_after.as_secs().max(1))]
    Duplicate { retry_after: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store corrupt: {0}")]
    Corrupt(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PosternError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidRecipient(_) => StatusCode::BAD_REQUEST,
            Self::MissingUser => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::AlreadyLoggedIn => StatusCode::CONFLICT,
            Self::NotLoggedIn => StatusCode::CONFLICT,
            Self::Duplicate { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Corrupt(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fetch(_) => StatusCode::BAD_REQUEST,
            Self::Upload(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Retry hint in seconds, present only for duplicate-suppression errors
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Duplicate { retry_after } => Some(retry_after.as_secs().max(1)),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PosternError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for PosternError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for PosternError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<reqwest::Error> for PosternError {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch(err.to_string())
    }
}

/// Result type alias for Postern operations
pub type Result<T> = std::result::Result<T, PosternError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PosternError::MissingUser.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PosternError::SessionNotFound("bob".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PosternError::AlreadyExists("bob".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PosternError::Duplicate {
                retry_after: Duration::from_secs(4)
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            PosternError::Timeout("send".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_duplicate_retry_hint() {
        let err = PosternError::Duplicate {
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(err.retry_after_secs(), Some(3));
        assert!(err.to_string().contains("retry after 3 seconds"));

        // Sub-second hints round up to one second
        let err = PosternError::Duplicate {
            retry_after: Duration::from_millis(200),
        };
        assert_eq!(err.retry_after_secs(), Some(1));

        assert_eq!(PosternError::MissingUser.retry_after_secs(), None);
    }
}
