use serde::{Serialize, Serializer};
use thiserror::Error;

/// Error taxonomy of the delivery engine.
#[derive(Debug, Error)]
pub enum ChatError {
    /// No open connection. Callers queue instead of failing.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Reconnection gave up; needs an explicit reconnect.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Delivery timed out for message {0}")]
    DeliveryTimeout(String),

    #[error("Duplicate message: {0}")]
    DuplicateMessage(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Storage access refused by the environment. Re-open the store to recover.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Coarse classification used by hosts that only care about the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TransportUnavailable,
    ConnectionFailed,
    DeliveryTimeout,
    DuplicateMessage,
    StorageFailure,
    PermissionDenied,
    InvalidInput,
    Internal,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            ChatError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            ChatError::DeliveryTimeout(_) => ErrorKind::DeliveryTimeout,
            ChatError::DuplicateMessage(_) => ErrorKind::DuplicateMessage,
            ChatError::StorageFailure(_) => ErrorKind::StorageFailure,
            ChatError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ChatError::InvalidMessage(_) | ChatError::Config(_) => ErrorKind::InvalidInput,
            ChatError::Serialization(_) | ChatError::Http(_) => ErrorKind::Internal,
        }
    }

    /// Whether the user can retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::DeliveryTimeout(_) | ChatError::TransportUnavailable(_)
        )
    }

    /// Map an I/O error from the storage layer, keeping permission refusals distinct.
    pub fn storage(context: &str, e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ChatError::PermissionDenied(format!("{}: {}", context, e))
        } else {
            ChatError::StorageFailure(format!("{}: {}", context, e))
        }
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        ChatError::storage("I/O", e)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Http(e.to_string())
    }
}

impl From<config::ConfigError> for ChatError {
    fn from(e: config::ConfigError) -> Self {
        ChatError::Config(e.to_string())
    }
}

// Hosts forward errors to a UI bridge as plain strings.
impl Serialize for ChatError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
