//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's internally
//! tagged enums. The `type` tag and all field names are camelCase.

use serde::{Deserialize, Serialize};

use crate::error::RoomError;
use crate::formatter::FormattedMessage;
use crate::types::{ConversationId, RoomId, SessionId, UserId};

/// The only room type clients can attach to
pub const CHAT_ROOM_TYPE: &str = "chat";

/// Client → Server message
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Attach to a room of type `room`
    ///
    /// Routed by `room_id` if present, else by `conversation_id`,
    /// else a fresh unbound room is created.
    #[serde(rename_all = "camelCase")]
    Join {
        room: String,
        conversation_id: Option<ConversationId>,
        user_id: UserId,
        room_id: Option<RoomId>,
    },
    /// Send a chat message to the current room
    #[serde(rename_all = "camelCase")]
    Message { sender_id: UserId, content: String },
    /// Typing indicator
    #[serde(rename_all = "camelCase")]
    Typing { user_id: UserId, is_typing: bool },
    /// Leave the current room
    Leave,
}

/// Server → Client message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Connection accepted, session id issued
    #[serde(rename_all = "camelCase")]
    Connected { session_id: SessionId },
    /// Join accepted
    #[serde(rename_all = "camelCase")]
    Joined {
        room_id: RoomId,
        session_id: SessionId,
        conversation_id: Option<ConversationId>,
    },
    /// Voluntary leave acknowledged
    #[serde(rename_all = "camelCase")]
    Left { room_id: RoomId },
    /// Persisted chat message
    Message(FormattedMessage),
    /// Another member's typing indicator
    #[serde(rename_all = "camelCase")]
    Typing { user_id: UserId, is_typing: bool },
    /// Another member joined the room
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: UserId, session_id: SessionId },
    /// A member left the room
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: UserId, session_id: SessionId },
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Rejected join or message payload
    Validation,
    /// Message could not be saved
    Persistence,
    /// Referenced record vanished
    NotFound,
    /// Room no longer exists
    Lifecycle,
    /// Frame was not a valid client message
    InvalidMessage,
}

impl ServerMessage {
    /// Error event for a frame that failed to parse
    pub fn invalid_message(err: &serde_json::Error) -> Self {
        ServerMessage::Error {
            code: ErrorCode::InvalidMessage,
            message: format!("Invalid message format: {}", err),
        }
    }
}

/// Convert RoomError to ServerMessage for client notification
impl From<RoomError> for ServerMessage {
    fn from(err: RoomError) -> Self {
        let (code, message) = match err {
            RoomError::Validation(reason) => (ErrorCode::Validation, reason),
            // Storage details stay in the logs
            RoomError::Persistence(_) => {
                (ErrorCode::Persistence, "Failed to save message".to_string())
            }
            RoomError::NotFound(what) => (ErrorCode::NotFound, format!("{} not found", what)),
            RoomError::Lifecycle(_) => {
                (ErrorCode::Lifecycle, "Room is no longer available".to_string())
            }
        };
        ServerMessage::Error { code, message }
    }
}
