//! Persisted entities
//!
//! Users, conversations, and messages as the store holds them.
//! Rooms never keep these beyond formatting a broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

/// Registered user
///
/// Carries storage-internal fields (`email`, `password_hash`) that must
/// never reach the wire through a formatted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// A thread between two participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Participants in insertion order
    pub participants: Vec<UserId>,
    /// Most recent message, for list previews
    pub last_message: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Whether this conversation is between exactly `a` and `b`, in either order
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        self.participants.len() == 2 && self.participants.contains(a) && self.participants.contains(b)
    }
}

/// Persisted chat message
///
/// Immutable after creation except for `read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationId,
    pub sender: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub read: bool,
}

/// A message with its sender record denormalized onto it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulatedMessage {
    pub message: Message,
    /// `None` when the sender record has vanished from the store
    pub sender: Option<User>,
}
