//! Room actor
//!
//! One room per live conversation. Every event for a room goes through its
//! mailbox and is handled to completion before the next one, so a message's
//! persist-then-broadcast sequence never interleaves with another event.
//!
//! Lifecycle:
//! ```text
//! Unbound ──join(conversationId)──▶ BoundActive ──last leave──▶ BoundEmpty ──▶ Disposed
//! ```
//! A room that reaches zero members disposes itself, deregisters from the
//! registry, and answers anything still queued with a lifecycle error.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::client::Member;
use crate::config::Config;
use crate::error::{RoomError, SendError, StoreError};
use crate::formatter::format_message;
use crate::message::ServerMessage;
use crate::model::PopulatedMessage;
use crate::registry::WeakRoomRegistry;
use crate::store::MessageStore;
use crate::types::{ConversationId, RoomId, SessionId, UserId};

/// Room lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// No conversation bound yet
    Unbound,
    /// Conversation bound, at least one member
    BoundActive,
    /// Conversation bound, no members (disposal follows immediately)
    BoundEmpty,
    /// Terminal
    Disposed,
}

/// Point-in-time view of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub conversation_id: Option<ConversationId>,
    pub state: RoomState,
    /// Members sorted by session id
    pub members: Vec<(SessionId, UserId)>,
}

/// Events delivered to a room's mailbox
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        session_id: SessionId,
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        sender: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Message {
        session_id: SessionId,
        sender_id: UserId,
        content: String,
    },
    Typing {
        session_id: SessionId,
        user_id: UserId,
        is_typing: bool,
    },
    Leave {
        session_id: SessionId,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    /// Forced disposal (registry removal or shutdown)
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable address of a running room
#[derive(Debug, Clone)]
pub struct RoomHandle {
    id: RoomId,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Whether the room has stopped accepting events
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the room has stopped accepting events
    pub async fn closed(&self) {
        self.sender.closed().await
    }

    /// Join `session_id` as `user_id`, routing room output to `sender`
    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), RoomError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(RoomCommand::Join {
            session_id,
            user_id,
            conversation_id,
            sender,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.gone("join"))?
    }

    /// Queue a chat message. Failures are reported to the sender's channel.
    pub async fn message(
        &self,
        session_id: SessionId,
        sender_id: UserId,
        content: String,
    ) -> Result<(), RoomError> {
        self.deliver(RoomCommand::Message {
            session_id,
            sender_id,
            content,
        })
        .await
    }

    pub async fn typing(
        &self,
        session_id: SessionId,
        user_id: UserId,
        is_typing: bool,
    ) -> Result<(), RoomError> {
        self.deliver(RoomCommand::Typing {
            session_id,
            user_id,
            is_typing,
        })
        .await
    }

    pub async fn leave(&self, session_id: SessionId) -> Result<(), RoomError> {
        self.deliver(RoomCommand::Leave { session_id }).await
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(RoomCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| self.gone("snapshot"))
    }

    /// Dispose the room and wait for it. Idempotent.
    pub async fn dispose(&self) {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(RoomCommand::Dispose { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn deliver(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.sender.send(cmd).await.map_err(|_| self.gone("deliver"))
    }

    fn gone(&self, action: &str) -> RoomError {
        error!("Room {} is disposed, cannot {}", self.id, action);
        RoomError::Lifecycle(format!("room {} is disposed", self.id))
    }
}

/// The room actor
pub struct Room {
    id: RoomId,
    /// Bound at most once
    conversation_id: Option<ConversationId>,
    members: HashMap<SessionId, Member>,
    disposed: bool,
    store: Arc<dyn MessageStore>,
    registry: WeakRoomRegistry,
    persist_timeout: Duration,
    receiver: mpsc::Receiver<RoomCommand>,
}

impl Room {
    /// Start a room actor and return its handle
    pub fn spawn(
        id: RoomId,
        store: Arc<dyn MessageStore>,
        registry: WeakRoomRegistry,
        config: &Config,
    ) -> RoomHandle {
        let (sender, receiver) = mpsc::channel(config.room_mailbox_capacity);
        let room = Self {
            id: id.clone(),
            conversation_id: None,
            members: HashMap::new(),
            disposed: false,
            store,
            registry,
            persist_timeout: config.persist_timeout,
            receiver,
        };
        tokio::spawn(room.run());
        RoomHandle { id, sender }
    }

    fn state(&self) -> RoomState {
        if self.disposed {
            RoomState::Disposed
        } else if self.conversation_id.is_none() {
            RoomState::Unbound
        } else if self.members.is_empty() {
            RoomState::BoundEmpty
        } else {
            RoomState::BoundActive
        }
    }

    /// Run the room event loop until disposal or until every handle is dropped
    async fn run(mut self) {
        debug!("Room {} started", self.id);

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
            if self.disposed {
                break;
            }
        }

        self.drain().await;
        debug!("Room {} stopped", self.id);
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                session_id,
                user_id,
                conversation_id,
                sender,
                reply,
            } => {
                let result = self
                    .handle_join(session_id, user_id, conversation_id, sender)
                    .await;
                if let Err(err) = &result {
                    warn!("Room {} rejected join from {}: {}", self.id, session_id, err);
                }
                let _ = reply.send(result);

                // A failed first join must not leave an empty room behind
                self.dispose_if_empty().await;
            }
            RoomCommand::Message {
                session_id,
                sender_id,
                content,
            } => {
                self.handle_message(session_id, sender_id, content).await;
                self.dispose_if_empty().await;
            }
            RoomCommand::Typing {
                session_id,
                user_id,
                is_typing,
            } => {
                self.handle_typing(session_id, user_id, is_typing);
                self.dispose_if_empty().await;
            }
            RoomCommand::Leave { session_id } => {
                self.handle_leave(session_id).await;
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            RoomCommand::Dispose { reply } => {
                self.dispose().await;
                let _ = reply.send(());
            }
        }
    }

    /// Handle a join request
    async fn handle_join(
        &mut self,
        session_id: SessionId,
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), RoomError> {
        if user_id.as_str().trim().is_empty() {
            return Err(RoomError::Validation("userId is required".to_string()));
        }
        if self.members.contains_key(&session_id) {
            return Err(RoomError::Validation("session already joined this room".to_string()));
        }

        if let Some(requested) = conversation_id {
            match &self.conversation_id {
                Some(bound) if *bound != requested => {
                    return Err(RoomError::Validation(format!(
                        "room is bound to conversation {}, not {}",
                        bound, requested
                    )));
                }
                Some(_) => {}
                None => {
                    let registry = self.registry.upgrade().ok_or_else(|| {
                        RoomError::Lifecycle("room registry has shut down".to_string())
                    })?;
                    registry.bind(&self.id, &requested).await?;
                    info!("Room {} bound to conversation {}", self.id, requested);
                    self.conversation_id = Some(requested);
                }
            }
        }

        let member = Member::new(session_id, user_id.clone(), sender);
        if let Err(err) = member.send(ServerMessage::Joined {
            room_id: self.id.clone(),
            session_id,
            conversation_id: self.conversation_id.clone(),
        }) {
            debug!("Room {}: could not confirm join to {}: {}", self.id, session_id, err);
        }

        self.members.insert(session_id, member);
        self.broadcast_except(
            session_id,
            ServerMessage::UserJoined {
                user_id: user_id.clone(),
                session_id,
            },
        );

        info!(
            "Client {} joined room {} as {} ({} members)",
            session_id,
            self.id,
            user_id,
            self.members.len()
        );
        Ok(())
    }

    /// Handle a chat message; errors go to the sending member only
    async fn handle_message(&mut self, session_id: SessionId, sender_id: UserId, content: String) {
        let Some(member) = self.members.get(&session_id).cloned() else {
            warn!("Room {} dropped message from non-member {}", self.id, session_id);
            return;
        };

        if let Err(err) = self.persist_and_broadcast(&member, sender_id, content).await {
            match &err {
                RoomError::Persistence(reason) => {
                    error!("Room {} failed to save message from {}: {}", self.id, session_id, reason)
                }
                other => debug!("Room {} rejected message from {}: {}", self.id, session_id, other),
            }
            if let Err(send_err) = member.send(err.into()) {
                debug!("Room {}: error for {} not delivered: {}", self.id, session_id, send_err);
            }
        }
    }

    /// Persist, denormalize, update the conversation, then broadcast to everyone
    async fn persist_and_broadcast(
        &mut self,
        member: &Member,
        sender_id: UserId,
        content: String,
    ) -> Result<(), RoomError> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return Err(RoomError::Validation(
                "room is not bound to a conversation".to_string(),
            ));
        };
        if sender_id != member.user_id {
            return Err(RoomError::Validation(
                "senderId does not match the joined user".to_string(),
            ));
        }
        if content.trim().is_empty() {
            return Err(RoomError::Validation("message content is empty".to_string()));
        }

        let message = self
            .bounded(
                "create message",
                self.store
                    .create_message(&conversation_id, &member.user_id, &content),
            )
            .await?;

        // From here on the message is durable; everything else is best-effort
        let populated = match self
            .bounded("populate sender", self.store.populate_sender(&message))
            .await
        {
            Ok(populated) => populated,
            Err(err) => {
                warn!("Room {}: sender of message {} unavailable: {}", self.id, message.id, err);
                PopulatedMessage {
                    message: message.clone(),
                    sender: None,
                }
            }
        };

        if let Err(err) = self
            .bounded(
                "update last message",
                self.store.update_last_message(&conversation_id, &message.id),
            )
            .await
        {
            warn!(
                "Room {}: could not update last message of {}: {}",
                self.id, conversation_id, err
            );
        }

        self.broadcast(ServerMessage::Message(format_message(&populated)));
        debug!("Room {} broadcast message {}", self.id, message.id);
        Ok(())
    }

    /// Relay a typing indicator to everyone but the sender
    fn handle_typing(&mut self, session_id: SessionId, user_id: UserId, is_typing: bool) {
        if !self.members.contains_key(&session_id) {
            warn!("Room {} dropped typing from non-member {}", self.id, session_id);
            return;
        }

        self.broadcast_except(session_id, ServerMessage::Typing { user_id, is_typing });
    }

    /// Remove a member; dispose when the room becomes empty
    async fn handle_leave(&mut self, session_id: SessionId) {
        let Some(member) = self.members.remove(&session_id) else {
            warn!("Room {} got leave from non-member {}", self.id, session_id);
            return;
        };

        // No-op send when the client already disconnected
        let _ = member.send(ServerMessage::Left {
            room_id: self.id.clone(),
        });

        self.broadcast(ServerMessage::UserLeft {
            user_id: member.user_id.clone(),
            session_id,
        });

        info!(
            "Client {} left room {} ({} members)",
            session_id,
            self.id,
            self.members.len()
        );

        self.dispose_if_empty().await;
    }

    async fn dispose_if_empty(&mut self) {
        if self.members.is_empty() {
            self.dispose().await;
        }
    }

    /// Terminal cleanup. Idempotent.
    async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        // Only non-empty on forced disposal
        for member in self.members.values() {
            let _ = member.send(RoomError::Lifecycle(format!("room {} closed", self.id)).into());
        }
        self.members.clear();

        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.id).await;
        }

        info!(
            "Room {} disposing (conversation {})",
            self.id,
            self.conversation_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unbound".to_string())
        );
    }

    /// Reject everything still queued after disposal
    async fn drain(&mut self) {
        self.receiver.close();

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RoomCommand::Join { session_id, reply, .. } => {
                    error!("Room {} received join from {} after disposal", self.id, session_id);
                    let _ = reply.send(Err(RoomError::Lifecycle(format!(
                        "room {} is disposed",
                        self.id
                    ))));
                }
                RoomCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                RoomCommand::Dispose { reply } => {
                    let _ = reply.send(());
                }
                RoomCommand::Leave { session_id } => {
                    // Members were already dropped by disposal
                    debug!("Room {} ignoring leave from {} after disposal", self.id, session_id);
                }
                other => {
                    error!("Room {} received {:?} after disposal", self.id, other);
                }
            }
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut members: Vec<(SessionId, UserId)> = self
            .members
            .values()
            .map(|m| (m.session_id, m.user_id.clone()))
            .collect();
        members.sort_by_key(|(session_id, _)| session_id.0);

        RoomSnapshot {
            room_id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            state: self.state(),
            members,
        }
    }

    /// Apply the persistence timeout to a store call
    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T, RoomError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.persist_timeout, call).await {
            Ok(result) => result.map_err(RoomError::from),
            Err(_) => Err(RoomError::Persistence(format!(
                "{} timed out after {:?}",
                what, self.persist_timeout
            ))),
        }
    }

    fn broadcast(&mut self, msg: ServerMessage) {
        self.fan_out(None, msg);
    }

    fn broadcast_except(&mut self, except: SessionId, msg: ServerMessage) {
        self.fan_out(Some(except), msg);
    }

    /// Deliver to every member but `except` without waiting on any of them.
    /// A member whose queue is full is evicted and announced as having left.
    fn fan_out(&mut self, except: Option<SessionId>, msg: ServerMessage) {
        let mut pending = VecDeque::from([(except, msg)]);

        while let Some((except, msg)) = pending.pop_front() {
            let mut lagging = Vec::new();
            for member in self.members.values() {
                if Some(member.session_id) == except {
                    continue;
                }
                match member.send(msg.clone()) {
                    Ok(()) => {}
                    Err(SendError::ChannelClosed) => {
                        debug!("Room {}: member {} already gone", self.id, member.session_id);
                    }
                    Err(SendError::Full) => lagging.push(member.session_id),
                }
            }

            for session_id in lagging {
                if let Some(member) = self.members.remove(&session_id) {
                    warn!(
                        "Room {}: evicting {} ({}), outbound queue is full",
                        self.id, session_id, member.user_id
                    );
                    pending.push_back((
                        None,
                        ServerMessage::UserLeft {
                            user_id: member.user_id,
                            session_id,
                        },
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;
    use crate::model::{Message, User};
    use crate::registry::RoomRegistry;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: RoomRegistry,
        alice: User,
        bob: User,
    }

    async fn fixture() -> Fixture {
        fixture_with(Config::default()).await
    }

    async fn fixture_with(config: Config) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let alice = store.create_user("alice", "alice@example.com", "hash-a").await;
        let bob = store.create_user("bob", "bob@example.com", "hash-b").await;
        let registry = RoomRegistry::spawn(store.clone(), config);
        Fixture {
            store,
            registry,
            alice,
            bob,
        }
    }

    fn registry_with(store: Arc<dyn MessageStore>, config: Config) -> RoomRegistry {
        RoomRegistry::spawn(store, config)
    }

    async fn join(
        room: &RoomHandle,
        user_id: &UserId,
        conversation_id: Option<&ConversationId>,
    ) -> (SessionId, mpsc::Receiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::channel(64);
        let session_id = SessionId::new();
        room.join(session_id, user_id.clone(), conversation_id.cloned(), tx)
            .await
            .unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::Joined { .. }));
        (session_id, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for room output")
            .expect("room output channel closed")
    }

    /// Asserts nothing is queued once the room has processed everything before it
    async fn assert_silent(room: &RoomHandle, rx: &mut mpsc::Receiver<ServerMessage>) {
        let _ = room.snapshot().await;
        if let Ok(msg) = rx.try_recv() {
            panic!("unexpected output: {:?}", msg);
        }
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn create_message(
            &self,
            _conversation: &ConversationId,
            _sender: &UserId,
            _content: &str,
        ) -> Result<Message, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn populate_sender(&self, message: &Message) -> Result<PopulatedMessage, StoreError> {
            Err(StoreError::NotFound(format!("user {}", message.sender)))
        }

        async fn update_last_message(
            &self,
            _conversation: &ConversationId,
            _message: &crate::types::MessageId,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct StalledStore;

    #[async_trait]
    impl MessageStore for StalledStore {
        async fn create_message(
            &self,
            _conversation: &ConversationId,
            _sender: &UserId,
            _content: &str,
        ) -> Result<Message, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(StoreError::Unavailable("never reached".to_string()))
        }

        async fn populate_sender(&self, message: &Message) -> Result<PopulatedMessage, StoreError> {
            Err(StoreError::NotFound(format!("user {}", message.sender)))
        }

        async fn update_last_message(
            &self,
            _conversation: &ConversationId,
            _message: &crate::types::MessageId,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_chat_scenario() {
        let fx = fixture().await;
        let conversation = fx
            .store
            .find_or_create_conversation(&fx.alice.id, &fx.bob.id)
            .await
            .unwrap();
        let room = fx.registry.get_or_create(&conversation.id).await.unwrap();

        let (a, mut a_rx) = join(&room, &fx.alice.id, Some(&conversation.id)).await;
        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(snapshot.conversation_id, Some(conversation.id.clone()));
        assert_eq!(snapshot.state, RoomState::BoundActive);

        let (b, mut b_rx) = join(&room, &fx.bob.id, Some(&conversation.id)).await;
        assert_eq!(
            next(&mut a_rx).await,
            ServerMessage::UserJoined {
                user_id: fx.bob.id.clone(),
                session_id: b,
            }
        );

        room.message(a, fx.alice.id.clone(), "hi".to_string())
            .await
            .unwrap();
        for rx in [&mut a_rx, &mut b_rx] {
            match next(rx).await {
                ServerMessage::Message(formatted) => {
                    assert_eq!(formatted.content, "hi");
                    assert_eq!(formatted.conversation, conversation.id);
                    assert_eq!(formatted.sender.id, fx.alice.id);
                    assert_eq!(formatted.sender.username.as_deref(), Some("alice"));
                }
                other => panic!("expected message, got {:?}", other),
            }
        }
        let stored = fx.store.recent_messages(&conversation.id, 50).await;
        assert_eq!(stored.len(), 1);
        let updated = fx.store.conversation(&conversation.id).await.unwrap();
        assert_eq!(updated.last_message, Some(stored[0].id.clone()));

        room.typing(b, fx.bob.id.clone(), true).await.unwrap();
        assert_eq!(
            next(&mut a_rx).await,
            ServerMessage::Typing {
                user_id: fx.bob.id.clone(),
                is_typing: true,
            }
        );
        assert_silent(&room, &mut b_rx).await;

        room.leave(b).await.unwrap();
        assert!(matches!(next(&mut b_rx).await, ServerMessage::Left { .. }));
        assert_eq!(
            next(&mut a_rx).await,
            ServerMessage::UserLeft {
                user_id: fx.bob.id.clone(),
                session_id: b,
            }
        );

        room.leave(a).await.unwrap();
        room.closed().await;
        assert!(fx.registry.lookup(&conversation.id).await.unwrap().is_none());
        assert_eq!(fx.registry.room_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_persist_reports_only_to_sender() {
        let registry = registry_with(Arc::new(FailingStore), Config::default());
        let conversation = ConversationId::from("c1");
        let room = registry.get_or_create(&conversation).await.unwrap();

        let u1 = UserId::from("u1");
        let (a, mut a_rx) = join(&room, &u1, Some(&conversation)).await;
        let (_b, mut b_rx) = join(&room, &UserId::from("u2"), Some(&conversation)).await;
        assert!(matches!(next(&mut a_rx).await, ServerMessage::UserJoined { .. }));

        room.message(a, u1, "hi".to_string()).await.unwrap();

        match next(&mut a_rx).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Persistence),
            other => panic!("expected error, got {:?}", other),
        }
        assert_silent(&room, &mut a_rx).await;
        assert_silent(&room, &mut b_rx).await;
        assert_eq!(room.snapshot().await.unwrap().state, RoomState::BoundActive);
    }

    #[tokio::test]
    async fn test_persist_timeout_is_persistence_error() {
        let config = Config {
            persist_timeout: Duration::from_millis(50),
            ..Config::default()
        };
        let registry = registry_with(Arc::new(StalledStore), config);
        let conversation = ConversationId::from("c1");
        let room = registry.get_or_create(&conversation).await.unwrap();

        let u1 = UserId::from("u1");
        let (a, mut a_rx) = join(&room, &u1, Some(&conversation)).await;
        room.message(a, u1, "hi".to_string()).await.unwrap();

        assert!(matches!(
            next(&mut a_rx).await,
            ServerMessage::Error {
                code: ErrorCode::Persistence,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_single_session_order_preserved() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();

        let (a, mut a_rx) = join(&room, &fx.alice.id, Some(&conversation)).await;
        let (_b, mut b_rx) = join(&room, &fx.bob.id, Some(&conversation)).await;
        assert!(matches!(next(&mut a_rx).await, ServerMessage::UserJoined { .. }));

        let sender = room.clone();
        let alice = fx.alice.id.clone();
        let producer = tokio::spawn(async move {
            for i in 0..20 {
                sender.message(a, alice.clone(), format!("m{}", i)).await.unwrap();
            }
        });
        producer.await.unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            for i in 0..20 {
                match next(rx).await {
                    ServerMessage::Message(formatted) => assert_eq!(formatted.content, format!("m{}", i)),
                    other => panic!("expected message, got {:?}", other),
                }
            }
        }

        let stored: Vec<String> = fx
            .store
            .recent_messages(&conversation, 50)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn test_conflicting_conversation_join_rejected() {
        let fx = fixture().await;
        let c1 = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&c1).await.unwrap();
        let (a, mut a_rx) = join(&room, &fx.alice.id, Some(&c1)).await;

        let (tx, _rx) = mpsc::channel(8);
        let result = room
            .join(SessionId::new(), fx.bob.id.clone(), Some(ConversationId::from("c2")), tx)
            .await;
        assert!(matches!(result, Err(RoomError::Validation(_))));

        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(snapshot.conversation_id, Some(c1));
        assert_eq!(snapshot.members, vec![(a, fx.alice.id.clone())]);
        assert_silent(&room, &mut a_rx).await;
    }

    #[tokio::test]
    async fn test_message_before_binding_rejected() {
        let fx = fixture().await;
        let room = fx.registry.create().await.unwrap();

        let (a, mut a_rx) = join(&room, &fx.alice.id, None).await;
        assert_eq!(room.snapshot().await.unwrap().state, RoomState::Unbound);

        room.message(a, fx.alice.id.clone(), "too early".to_string())
            .await
            .unwrap();
        assert!(matches!(
            next(&mut a_rx).await,
            ServerMessage::Error {
                code: ErrorCode::Validation,
                ..
            }
        ));

        // A later join supplies the conversation
        let c5 = ConversationId::from("c5");
        let (_b, _b_rx) = join(&room, &fx.bob.id, Some(&c5)).await;
        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(snapshot.conversation_id, Some(c5.clone()));
        assert_eq!(snapshot.state, RoomState::BoundActive);

        let found = fx.registry.lookup(&c5).await.unwrap().unwrap();
        assert_eq!(found.id(), room.id());
        assert!(fx.store.recent_messages(&c5, 50).await.is_empty());
    }

    #[tokio::test]
    async fn test_membership_after_join_leave_replay() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();

        let mut sessions = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let user = UserId::from(format!("u{}", i));
            let (session, rx) = join(&room, &user, Some(&conversation)).await;
            sessions.push((session, user));
            receivers.push(rx);
        }

        room.leave(sessions[1].0).await.unwrap();
        room.leave(sessions[3].0).await.unwrap();
        // Unknown and repeated leaves change nothing
        room.leave(SessionId::new()).await.unwrap();
        room.leave(sessions[1].0).await.unwrap();

        let mut expected = vec![
            sessions[0].clone(),
            sessions[2].clone(),
            sessions[4].clone(),
        ];
        expected.sort_by_key(|(session, _)| session.0);
        assert_eq!(room.snapshot().await.unwrap().members, expected);
    }

    #[tokio::test]
    async fn test_duplicate_session_join_rejected() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();
        let (a, _a_rx) = join(&room, &fx.alice.id, Some(&conversation)).await;

        let (tx, _rx) = mpsc::channel(8);
        let result = room.join(a, fx.alice.id.clone(), Some(conversation), tx).await;
        assert!(matches!(result, Err(RoomError::Validation(_))));
        assert_eq!(room.snapshot().await.unwrap().members.len(), 1);
    }

    #[tokio::test]
    async fn test_last_leave_disposes_and_new_room_is_empty() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();
        let (a, _a_rx) = join(&room, &fx.alice.id, Some(&conversation)).await;

        room.leave(a).await.unwrap();
        room.closed().await;

        assert!(matches!(
            room.message(a, fx.alice.id.clone(), "late".to_string()).await,
            Err(RoomError::Lifecycle(_))
        ));

        let fresh = fx.registry.get_or_create(&conversation).await.unwrap();
        assert_ne!(fresh.id(), room.id());
        let snapshot = fresh.snapshot().await.unwrap();
        assert!(snapshot.members.is_empty());
        assert_eq!(snapshot.state, RoomState::Unbound);
    }

    #[tokio::test]
    async fn test_failed_first_join_disposes_room() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let result = room
            .join(SessionId::new(), UserId::from(""), Some(conversation.clone()), tx)
            .await;
        assert!(matches!(result, Err(RoomError::Validation(_))));

        room.closed().await;
        assert!(fx.registry.lookup(&conversation).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sender_mismatch_rejected() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();
        let (a, mut a_rx) = join(&room, &fx.alice.id, Some(&conversation)).await;

        room.message(a, fx.bob.id.clone(), "spoofed".to_string())
            .await
            .unwrap();
        assert!(matches!(
            next(&mut a_rx).await,
            ServerMessage::Error {
                code: ErrorCode::Validation,
                ..
            }
        ));
        assert!(fx.store.recent_messages(&conversation, 50).await.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_sender_still_broadcast() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();
        let ghost = UserId::from("ghost");
        let (a, mut a_rx) = join(&room, &ghost, Some(&conversation)).await;

        room.message(a, ghost.clone(), "boo".to_string()).await.unwrap();
        match next(&mut a_rx).await {
            ServerMessage::Message(formatted) => {
                assert_eq!(formatted.sender.id, ghost);
                assert!(formatted.sender.username.is_none());
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnected_member_does_not_block_broadcast() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();

        let (a, mut a_rx) = join(&room, &fx.alice.id, Some(&conversation)).await;
        let (_b, b_rx) = join(&room, &fx.bob.id, Some(&conversation)).await;
        assert!(matches!(next(&mut a_rx).await, ServerMessage::UserJoined { .. }));
        drop(b_rx);

        room.message(a, fx.alice.id.clone(), "still here".to_string())
            .await
            .unwrap();
        assert!(matches!(next(&mut a_rx).await, ServerMessage::Message(_)));
    }

    #[tokio::test]
    async fn test_stalled_member_is_evicted() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();

        // Alice's client never reads its queue
        let (stalled_tx, _stalled_rx) = mpsc::channel(4);
        let stalled = SessionId::new();
        room.join(stalled, fx.alice.id.clone(), Some(conversation.clone()), stalled_tx)
            .await
            .unwrap();
        let (b, mut b_rx) = join(&room, &fx.bob.id, Some(&conversation)).await;

        for i in 0..10 {
            room.typing(b, fx.bob.id.clone(), i % 2 == 0).await.unwrap();
        }

        let snapshot = tokio::time::timeout(Duration::from_secs(2), room.snapshot())
            .await
            .expect("room stopped answering")
            .unwrap();
        assert_eq!(snapshot.members, vec![(b, fx.bob.id.clone())]);
        assert_eq!(snapshot.state, RoomState::BoundActive);

        match next(&mut b_rx).await {
            ServerMessage::UserLeft { user_id, session_id } => {
                assert_eq!(user_id, fx.alice.id);
                assert_eq!(session_id, stalled);
            }
            other => panic!("expected userLeft, got {:?}", other),
        }

        // The room keeps persisting for everyone else
        room.message(b, fx.bob.id.clone(), "anyone there?".to_string())
            .await
            .unwrap();
        assert!(matches!(next(&mut b_rx).await, ServerMessage::Message(_)));
        assert_eq!(fx.store.recent_messages(&conversation, 50).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_disconnect_still_persists() {
        let fx = fixture().await;
        let conversation = ConversationId::from("c1");
        let room = fx.registry.get_or_create(&conversation).await.unwrap();

        let (a, a_rx) = join(&room, &fx.alice.id, Some(&conversation)).await;
        let (b, mut b_rx) = join(&room, &fx.bob.id, Some(&conversation)).await;

        // Alice's connection drops right after her message is queued
        room.message(a, fx.alice.id.clone(), "last words".to_string())
            .await
            .unwrap();
        drop(a_rx);
        room.leave(a).await.unwrap();

        match next(&mut b_rx).await {
            ServerMessage::Message(formatted) => assert_eq!(formatted.content, "last words"),
            other => panic!("expected message, got {:?}", other),
        }
        assert!(matches!(next(&mut b_rx).await, ServerMessage::UserLeft { .. }));

        let stored = fx.store.recent_messages(&conversation, 50).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender, fx.alice.id);

        room.leave(b).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), room.closed())
            .await
            .expect("room did not dispose");
        assert!(fx.registry.lookup(&conversation).await.unwrap().is_none());
    }
}
