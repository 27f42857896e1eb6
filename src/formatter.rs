//! Message formatter
//!
//! Projects a persisted message into the shape clients see. The sender is
//! reduced to id and username; every other stored field is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::PopulatedMessage;
use crate::types::{ConversationId, MessageId, UserId};

/// Sender identity as exposed on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderSummary {
    #[serde(rename = "_id")]
    pub id: UserId,
    /// `None` when the sender record could not be populated
    pub username: Option<String>,
}

/// Wire projection of a persisted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub conversation: ConversationId,
    pub content: String,
    pub sender: SenderSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub read: bool,
}

/// Format a populated message for broadcast
pub fn format_message(populated: &PopulatedMessage) -> FormattedMessage {
    let message = &populated.message;
    FormattedMessage {
        id: message.id.clone(),
        conversation: message.conversation.clone(),
        content: message.content.clone(),
        sender: SenderSummary {
            id: message.sender.clone(),
            username: populated.sender.as_ref().map(|u| u.username.clone()),
        },
        created_at: message.created_at,
        updated_at: message.updated_at,
        read: message.read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, User};

    fn populated(sender: Option<User>) -> PopulatedMessage {
        let now = Utc::now();
        PopulatedMessage {
            message: Message {
                id: MessageId::from("m1"),
                conversation: ConversationId::from("c1"),
                sender: UserId::from("u1"),
                content: "hi".to_string(),
                created_at: now,
                updated_at: now,
                read: false,
            },
            sender,
        }
    }

    fn alice() -> User {
        User {
            id: UserId::from("u1"),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "$argon2id$secret".to_string(),
        }
    }

    #[test]
    fn test_format_copies_message_fields() {
        let input = populated(Some(alice()));
        let formatted = format_message(&input);

        assert_eq!(formatted.id, input.message.id);
        assert_eq!(formatted.conversation, input.message.conversation);
        assert_eq!(formatted.content, "hi");
        assert_eq!(formatted.sender.id, UserId::from("u1"));
        assert_eq!(formatted.sender.username.as_deref(), Some("alice"));
        assert_eq!(formatted.created_at, input.message.created_at);
        assert!(!formatted.read);
    }

    #[test]
    fn test_format_exposes_only_projection() {
        let json = serde_json::to_value(format_message(&populated(Some(alice())))).unwrap();

        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["_id", "content", "conversation", "createdAt", "read", "sender", "updatedAt"]
        );

        let mut sender_keys: Vec<_> = json["sender"].as_object().unwrap().keys().cloned().collect();
        sender_keys.sort();
        assert_eq!(sender_keys, vec!["_id", "username"]);

        let text = json.to_string();
        assert!(!text.contains("password"));
        assert!(!text.contains("alice@example.com"));
    }

    #[test]
    fn test_format_without_sender_record() {
        let formatted = format_message(&populated(None));
        assert_eq!(formatted.sender.id, UserId::from("u1"));
        assert!(formatted.sender.username.is_none());
    }
}
