//! Message store boundary
//!
//! `MessageStore` is the contract a room consumes: create a message,
//! denormalize its sender, and move the conversation's last-message
//! pointer. `MemoryStore` is an in-process document store implementing it,
//! plus the collaborator operations the REST surface sits on
//! (users, conversation find-or-create, message history).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::model::{Conversation, Message, PopulatedMessage, User};
use crate::types::{ConversationId, MessageId, UserId};

/// Maximum number of messages returned by a history fetch
pub const HISTORY_LIMIT: usize = 50;

/// Persistence operations a room depends on
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message. Fails with `StoreError::Unavailable` on storage failure.
    async fn create_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Attach the sender's user record. Fails with `StoreError::NotFound` if it vanished.
    async fn populate_sender(&self, message: &Message) -> Result<PopulatedMessage, StoreError>;

    /// Point the conversation's `last_message` at `message`.
    async fn update_last_message(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Collections {
    users: HashMap<UserId, User>,
    conversations: HashMap<ConversationId, Conversation>,
    /// Per-conversation messages in creation order
    messages: HashMap<ConversationId, Vec<Message>>,
}

/// In-memory document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user. The password hash is stored opaquely.
    pub async fn create_user(&self, username: &str, email: &str, password_hash: &str) -> User {
        let user = User {
            id: UserId::generate(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
        };
        self.inner
            .write()
            .await
            .users
            .insert(user.id.clone(), user.clone());
        debug!("Registered user {} ({})", user.username, user.id);
        user
    }

    pub async fn user(&self, id: &UserId) -> Option<User> {
        self.inner.read().await.users.get(id).cloned()
    }

    pub async fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.inner.read().await.conversations.get(id).cloned()
    }

    /// Return the conversation between `a` and `b`, creating it on first contact
    ///
    /// Lookup is symmetric: `(a, b)` and `(b, a)` resolve to the same record.
    pub async fn find_or_create_conversation(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<Conversation, StoreError> {
        if a == b {
            return Err(StoreError::InvalidParticipants);
        }

        // Write lock for the whole lookup so two first contacts can't both insert
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.conversations.values().find(|c| c.is_between(a, b)) {
            return Ok(existing.clone());
        }

        let conversation = Conversation {
            id: ConversationId::generate(),
            participants: vec![a.clone(), b.clone()],
            last_message: None,
            created_at: Utc::now(),
        };
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        debug!("Created conversation {} between {} and {}", conversation.id, a, b);
        Ok(conversation)
    }

    /// Conversations `user` participates in, oldest first
    pub async fn conversations_for(&self, user: &UserId) -> Vec<Conversation> {
        let inner = self.inner.read().await;
        let mut found: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.participants.contains(user))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        found
    }

    /// The newest `min(limit, HISTORY_LIMIT)` messages, returned oldest-first
    pub async fn recent_messages(&self, conversation: &ConversationId, limit: usize) -> Vec<Message> {
        let limit = limit.min(HISTORY_LIMIT);
        let inner = self.inner.read().await;
        let Some(messages) = inner.messages.get(conversation) else {
            return Vec::new();
        };

        let start = messages.len().saturating_sub(limit);
        messages[start..].to_vec()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        let now = Utc::now();
        let message = Message {
            id: MessageId::generate(),
            conversation: conversation.clone(),
            sender: sender.clone(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
            read: false,
        };

        self.inner
            .write()
            .await
            .messages
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());

        trace!("Stored message {} in {}", message.id, conversation);
        Ok(message)
    }

    async fn populate_sender(&self, message: &Message) -> Result<PopulatedMessage, StoreError> {
        let sender = self
            .user(&message.sender)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("user {}", message.sender)))?;

        Ok(PopulatedMessage {
            message: message.clone(),
            sender: Some(sender),
        })
    }

    async fn update_last_message(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .conversations
            .get_mut(conversation)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation)))?;
        record.last_message = Some(message.clone());
        Ok(())
    }
}
