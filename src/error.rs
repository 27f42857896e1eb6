//! Error types for the chat relay
//!
//! Defines connection-fatal errors, the per-event room error taxonomy,
//! store boundary errors, and message send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// These terminate a connection (or the process, for configuration).
/// Per-event failures are `RoomError`s instead.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while handling a single room event
///
/// Caught at the room boundary and turned into a client-directed
/// `error` event. None of them takes the room down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// Malformed join/message payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store unavailable, write failed, or timed out
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Referenced sender or conversation vanished
    #[error("Not found: {0}")]
    NotFound(String),

    /// Action on a disposed room (registry invariant violated)
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

/// Errors returned by the message store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Storage backend unavailable or write failed
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Referenced record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A conversation needs two distinct participants
    #[error("a conversation needs two distinct participants")]
    InvalidParticipants,
}

impl From<StoreError> for RoomError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => RoomError::Persistence(reason),
            StoreError::NotFound(what) => RoomError::NotFound(what),
            StoreError::InvalidParticipants => {
                RoomError::Validation(StoreError::InvalidParticipants.to_string())
            }
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held an unparsable value
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Message send errors
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The client is not draining its queue
    #[error("Channel full")]
    Full,
}
