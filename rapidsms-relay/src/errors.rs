use crate::config::{ConfigError, ValidationError};
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors that stop the relay service itself. Per-call failures have their
/// own types and are handled where they occur.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("reply store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("service is {0}, expected {1}")]
    InvalidState(&'static str, &'static str),

    #[error("HTTP listener task failed: {0}")]
    ListenerTask(String),
}

/// Failures of the expiring key-value store backing reply correlation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("stored entry is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,
}

/// Failures reported by the backbone when asked to send a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackboneError {
    #[error("unknown send_to tag: {0}")]
    UnknownTag(String),

    #[error("backbone connection is closed")]
    Closed,

    #[error("send rejected: {0}")]
    Rejected(String),
}
