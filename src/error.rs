//! Error types for the queue client.
//!
//! Startup failures (`TransportConnect`, `Warmup`) are meant to reach the
//! service's own startup sequence. Handler failures never leave the
//! subscription callback; they are carried as [`HandlerError`] into the
//! retry/dead-letter path.

use std::fmt;

/// Error returned by a message handler.
///
/// The text is what ends up in `QueueMessage::error_message` and in the
/// dead-letter envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("invalid payload: {}", err))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to connect to broker at {url}: {reason}")]
    TransportConnect { url: String, reason: String },

    #[error("broker is not connected")]
    NotConnected,

    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },

    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("malformed envelope: {0}")]
    EnvelopeDecode(String),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("message {0} not found in DLQ")]
    DlqNotFound(String),

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("resource warm-up failed: {0}")]
    Warmup(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Boxed error used at collaborator seams (warm-up loaders).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
