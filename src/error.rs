use thiserror::Error;

use crate::frame::error_codes;

/// Failure raised by a dispatched handler or a stream producer.
///
/// The router turns this into an `error` frame; `code` defaults to
/// `HANDLER_ERROR` when the handler did not pick one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub code: Option<String>,
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_code(error_codes::INVALID_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_code(error_codes::NOT_FOUND, message)
    }

    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or(error_codes::HANDLER_ERROR)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::not_found(err.to_string()),
            StoreError::InvalidId(_) => Self::invalid_request(err.to_string()),
            other => Self::new(other.to_string()),
        }
    }
}

/// The outbound channel to the webview is gone or refused the frame.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("backend initialization failed: {0}")]
    InitFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task {0} is already registered")]
    DuplicateTaskId(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("invalid conversation id {0:?}")]
    InvalidId(String),
    #[error("conversation storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("conversation storage is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to write config: {0}")]
    Write(String),
}

/// The stdio runner could not start or lost its transport.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_defaults_code() {
        let err = HandlerError::new("boom");
        assert_eq!(err.code(), "HANDLER_ERROR");
        assert_eq!(err.to_string(), "boom");

        let err = HandlerError::with_code("CUSTOM", "nope");
        assert_eq!(err.code(), "CUSTOM");
    }

    #[test]
    fn test_store_not_found_maps_to_not_found_code() {
        let err: HandlerError = StoreError::NotFound("c9".to_string()).into();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(err.message.contains("c9"));

        let err: HandlerError = StoreError::InvalidId("../x".to_string()).into();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }
}
