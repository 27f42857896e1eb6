//! Room registry actor
//!
//! Owns the mapping from conversation to its single live room. All lookups
//! and mutations go through one mailbox, so two simultaneous first joins
//! for the same conversation resolve to the same room.
//!
//! Rooms hold only a weak handle back to the registry; the registry stops
//! when `shutdown` is called or every strong handle is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::RoomError;
use crate::room::{Room, RoomHandle};
use crate::store::MessageStore;
use crate::types::{ConversationId, RoomId};

/// Commands sent to the registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Live room for a conversation, created if absent
    GetOrCreate {
        conversation_id: ConversationId,
        reply: oneshot::Sender<RoomHandle>,
    },
    /// Fresh room with no conversation reserved
    Create { reply: oneshot::Sender<RoomHandle> },
    /// Room by id
    Get {
        room_id: RoomId,
        reply: oneshot::Sender<Option<RoomHandle>>,
    },
    /// Room by conversation, without creating
    Lookup {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Option<RoomHandle>>,
    },
    /// A room binding its conversation on first join
    Bind {
        room_id: RoomId,
        conversation_id: ConversationId,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    /// Drop a conversation's mapping and dispose its room
    Remove { conversation_id: ConversationId },
    /// A disposed room deregistering itself
    Release { room_id: RoomId },
    /// Number of registered rooms
    Count { reply: oneshot::Sender<usize> },
    /// Dispose every room and stop
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable handle to the registry actor
#[derive(Debug, Clone)]
pub struct RoomRegistry {
    sender: mpsc::Sender<RegistryCommand>,
}

/// Non-owning registry handle held by rooms
#[derive(Debug, Clone)]
pub struct WeakRoomRegistry {
    sender: mpsc::WeakSender<RegistryCommand>,
}

impl WeakRoomRegistry {
    pub fn upgrade(&self) -> Option<RoomRegistry> {
        self.sender.upgrade().map(|sender| RoomRegistry { sender })
    }
}

impl RoomRegistry {
    /// Start the registry actor
    pub fn spawn(store: Arc<dyn MessageStore>, config: Config) -> Self {
        let (sender, receiver) = mpsc::channel(config.room_mailbox_capacity);
        let registry = Registry {
            rooms: HashMap::new(),
            by_conversation: HashMap::new(),
            store,
            config,
            weak: sender.downgrade(),
            receiver,
        };
        tokio::spawn(registry.run());
        Self { sender }
    }

    /// The single live room for `conversation_id`, creating one if none exists
    pub async fn get_or_create(&self, conversation_id: &ConversationId) -> Result<RoomHandle, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::GetOrCreate {
                conversation_id: conversation_id.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    /// A new unbound room
    pub async fn create(&self) -> Result<RoomHandle, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Create { reply }, rx).await
    }

    pub async fn get(&self, room_id: &RoomId) -> Result<Option<RoomHandle>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Get {
                room_id: room_id.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn lookup(&self, conversation_id: &ConversationId) -> Result<Option<RoomHandle>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Lookup {
                conversation_id: conversation_id.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Claim `conversation_id` for `room_id`
    pub async fn bind(&self, room_id: &RoomId, conversation_id: &ConversationId) -> Result<(), RoomError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Bind {
                room_id: room_id.clone(),
                conversation_id: conversation_id.clone(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Drop the mapping for `conversation_id`, disposing its room
    pub async fn remove(&self, conversation_id: &ConversationId) {
        let _ = self
            .sender
            .send(RegistryCommand::Remove {
                conversation_id: conversation_id.clone(),
            })
            .await;
    }

    pub(crate) async fn release(&self, room_id: &RoomId) {
        let _ = self
            .sender
            .send(RegistryCommand::Release {
                room_id: room_id.clone(),
            })
            .await;
    }

    pub async fn room_count(&self) -> Result<usize, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Count { reply }, rx).await
    }

    /// Dispose all rooms and stop the registry
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn request<T>(&self, cmd: RegistryCommand, rx: oneshot::Receiver<T>) -> Result<T, RoomError> {
        if self.sender.send(cmd).await.is_err() {
            return Err(stopped());
        }
        rx.await.map_err(|_| stopped())
    }
}

fn stopped() -> RoomError {
    error!("Room registry has stopped");
    RoomError::Lifecycle("room registry has stopped".to_string())
}

struct RoomEntry {
    handle: RoomHandle,
    /// Conversation reserved or bound for this room
    conversation: Option<ConversationId>,
}

/// The registry actor
struct Registry {
    rooms: HashMap<RoomId, RoomEntry>,
    by_conversation: HashMap<ConversationId, RoomId>,
    store: Arc<dyn MessageStore>,
    config: Config,
    weak: mpsc::WeakSender<RegistryCommand>,
    receiver: mpsc::Receiver<RegistryCommand>,
}

impl Registry {
    async fn run(mut self) {
        info!("Room registry started");

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle_command(cmd).await {
                return;
            }
        }

        info!("Room registry shutting down");
    }

    /// Process a single command. Returns false once the registry has shut down.
    async fn handle_command(&mut self, cmd: RegistryCommand) -> bool {
        match cmd {
            RegistryCommand::GetOrCreate {
                conversation_id,
                reply,
            } => {
                let handle = self.get_or_create(conversation_id);
                let _ = reply.send(handle);
            }
            RegistryCommand::Create { reply } => {
                let handle = self.create_room(None);
                let _ = reply.send(handle);
            }
            RegistryCommand::Get { room_id, reply } => {
                let handle = self
                    .rooms
                    .get(&room_id)
                    .filter(|entry| !entry.handle.is_closed())
                    .map(|entry| entry.handle.clone());
                let _ = reply.send(handle);
            }
            RegistryCommand::Lookup {
                conversation_id,
                reply,
            } => {
                let handle = self
                    .by_conversation
                    .get(&conversation_id)
                    .and_then(|room_id| self.rooms.get(room_id))
                    .filter(|entry| !entry.handle.is_closed())
                    .map(|entry| entry.handle.clone());
                let _ = reply.send(handle);
            }
            RegistryCommand::Bind {
                room_id,
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.bind(room_id, conversation_id));
            }
            RegistryCommand::Remove { conversation_id } => {
                if let Some(room_id) = self.by_conversation.remove(&conversation_id) {
                    if let Some(entry) = self.rooms.remove(&room_id) {
                        info!("Removed room {} for conversation {}", room_id, conversation_id);
                        // Never await a room from inside the registry loop
                        tokio::spawn(async move { entry.handle.dispose().await });
                    }
                }
            }
            RegistryCommand::Release { room_id } => {
                self.release(&room_id);
            }
            RegistryCommand::Count { reply } => {
                let _ = reply.send(self.rooms.len());
            }
            RegistryCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn get_or_create(&mut self, conversation_id: ConversationId) -> RoomHandle {
        if let Some(room_id) = self.by_conversation.get(&conversation_id).cloned() {
            match self.rooms.get(&room_id) {
                Some(entry) if !entry.handle.is_closed() => return entry.handle.clone(),
                _ => {
                    // Its release is still queued behind this request
                    debug!("Replacing disposed room {} for conversation {}", room_id, conversation_id);
                    self.rooms.remove(&room_id);
                    self.by_conversation.remove(&conversation_id);
                }
            }
        }

        let handle = self.create_room(Some(conversation_id.clone()));
        self.by_conversation
            .insert(conversation_id, handle.id().clone());
        handle
    }

    fn create_room(&mut self, conversation: Option<ConversationId>) -> RoomHandle {
        let room_id = loop {
            let id = RoomId::generate();
            if !self.rooms.contains_key(&id) {
                break id;
            }
        };

        let weak = WeakRoomRegistry {
            sender: self.weak.clone(),
        };
        let handle = Room::spawn(room_id.clone(), self.store.clone(), weak, &self.config);

        info!(
            "Created room {} (conversation {})",
            room_id,
            conversation
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unbound".to_string())
        );
        self.rooms.insert(
            room_id,
            RoomEntry {
                handle: handle.clone(),
                conversation,
            },
        );
        debug!("Total rooms: {}", self.rooms.len());
        handle
    }

    fn bind(&mut self, room_id: RoomId, conversation_id: ConversationId) -> Result<(), RoomError> {
        let Some(entry) = self.rooms.get_mut(&room_id) else {
            return Err(RoomError::Lifecycle(format!("room {} is not registered", room_id)));
        };

        match &entry.conversation {
            Some(existing) if *existing == conversation_id => return Ok(()),
            Some(existing) => {
                return Err(RoomError::Validation(format!(
                    "room {} is reserved for conversation {}",
                    room_id, existing
                )));
            }
            None => {}
        }

        if let Some(owner) = self.by_conversation.get(&conversation_id) {
            return Err(RoomError::Validation(format!(
                "conversation {} already has live room {}",
                conversation_id, owner
            )));
        }

        entry.conversation = Some(conversation_id.clone());
        self.by_conversation.insert(conversation_id, room_id);
        Ok(())
    }

    fn release(&mut self, room_id: &RoomId) {
        let Some(entry) = self.rooms.remove(room_id) else {
            return;
        };

        if let Some(conversation_id) = entry.conversation {
            // The mapping may already point at a replacement room
            if self.by_conversation.get(&conversation_id) == Some(room_id) {
                self.by_conversation.remove(&conversation_id);
            }
        }
        debug!("Released room {} (total rooms: {})", room_id, self.rooms.len());
    }

    async fn shutdown(&mut self) {
        info!("Room registry shutting down ({} rooms)", self.rooms.len());

        // Rooms releasing themselves must not block on a full mailbox
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}

        self.by_conversation.clear();
        for (_, entry) in self.rooms.drain() {
            entry.handle.dispose().await;
        }
    }
}
