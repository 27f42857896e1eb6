//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, session id
//! assignment, routing joins through the registry, and forwarding client
//! events to the joined room.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, RoomError};
use crate::message::{ClientMessage, ServerMessage, CHAT_ROOM_TYPE};
use crate::registry::RoomRegistry;
use crate::room::RoomHandle;
use crate::types::{ConversationId, RoomId, SessionId, UserId};

/// Handle a new TCP connection
///
/// Performs WebSocket handshake, sets up bidirectional communication,
/// and manages the connection lifecycle.
pub async fn handle_connection(
    stream: TcpStream,
    registry: RoomRegistry,
    channel_capacity: usize,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let session_id = SessionId::new();
    info!("Session {} connected from {}", session_id, peer_addr);

    // Channel for room/server -> client messages
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(channel_capacity);

    let connected_msg = ServerMessage::Connected { session_id };
    let json = serde_json::to_string(&connected_msg)?;
    ws_sender.send(Message::Text(json.into())).await?;

    // Write task (ServerMessage -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                }
            }
        }
        debug!("Write task ended for session");

        let _ = ws_sender.close().await;
    });

    let mut session = Session::new(session_id, registry, msg_tx);

    // Read loop (WebSocket -> Room)
    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Session {} closed the connection", session_id);
                    break;
                }
                Some(Ok(Message::Ping(_))) => {
                    // Pong is handled automatically by tungstenite
                    debug!("Ping from {}", session_id);
                }
                Some(Ok(_)) => {
                    // Binary or other message types - ignore
                }
                Some(Err(e)) => {
                    error!("WebSocket error for {}: {}", session_id, e);
                    break;
                }
            },
            _ = &mut write_task => {
                debug!("Write task completed for {}", session_id);
                break;
            }
        }
    }

    // Any in-flight message is already queued ahead of this leave
    session.disconnect().await;

    info!("Session {} disconnected", session_id);

    Ok(())
}

/// Per-connection state: the session and the room it has joined, if any
struct Session {
    id: SessionId,
    registry: RoomRegistry,
    outbound: mpsc::Sender<ServerMessage>,
    room: Option<RoomHandle>,
}

impl Session {
    fn new(id: SessionId, registry: RoomRegistry, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            registry,
            outbound,
            room: None,
        }
    }

    async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => {
                warn!("Invalid JSON from {}: {}", self.id, e);
                self.notify(ServerMessage::invalid_message(&e)).await;
            }
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) {
        let result = match msg {
            ClientMessage::Join {
                room,
                conversation_id,
                user_id,
                room_id,
            } => self.join(room, conversation_id, user_id, room_id).await,
            ClientMessage::Message { sender_id, content } => match self.current_room() {
                Ok(room) => room.message(self.id, sender_id, content).await,
                Err(err) => Err(err),
            },
            ClientMessage::Typing { user_id, is_typing } => match self.current_room() {
                Ok(room) => room.typing(self.id, user_id, is_typing).await,
                Err(err) => Err(err),
            },
            ClientMessage::Leave => match self.room.take() {
                Some(room) => room.leave(self.id).await,
                None => Err(not_in_room()),
            },
        };

        if let Err(err) = result {
            if matches!(err, RoomError::Lifecycle(_)) {
                // The room is gone; forget it so the client can join again
                self.room = None;
            }
            self.notify(err.into()).await;
        }
    }

    async fn join(
        &mut self,
        room_type: String,
        conversation_id: Option<ConversationId>,
        user_id: UserId,
        room_id: Option<RoomId>,
    ) -> Result<(), RoomError> {
        if self.room.is_some() {
            return Err(RoomError::Validation("already in a room".to_string()));
        }
        if room_type != CHAT_ROOM_TYPE {
            return Err(RoomError::Validation(format!("unknown room type '{}'", room_type)));
        }

        let mut retried = false;
        loop {
            let room = self.resolve(conversation_id.as_ref(), room_id.as_ref()).await?;
            match room
                .join(
                    self.id,
                    user_id.clone(),
                    conversation_id.clone(),
                    self.outbound.clone(),
                )
                .await
            {
                Ok(()) => {
                    self.room = Some(room);
                    return Ok(());
                }
                // The registry handed out a room that disposed before our join landed
                Err(RoomError::Lifecycle(reason))
                    if room_id.is_none() && conversation_id.is_some() && !retried =>
                {
                    error!("Session {} join raced disposal ({}), retrying", self.id, reason);
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pick the target room for a join
    async fn resolve(
        &self,
        conversation_id: Option<&ConversationId>,
        room_id: Option<&RoomId>,
    ) -> Result<RoomHandle, RoomError> {
        match (room_id, conversation_id) {
            (Some(room_id), _) => self
                .registry
                .get(room_id)
                .await?
                .ok_or_else(|| RoomError::NotFound(format!("room {}", room_id))),
            (None, Some(conversation_id)) => self.registry.get_or_create(conversation_id).await,
            (None, None) => self.registry.create().await,
        }
    }

    fn current_room(&self) -> Result<&RoomHandle, RoomError> {
        self.room.as_ref().ok_or_else(not_in_room)
    }

    async fn notify(&self, msg: ServerMessage) {
        if self.outbound.send(msg).await.is_err() {
            debug!("Session {} outbound channel closed", self.id);
        }
    }

    async fn disconnect(&mut self) {
        if let Some(room) = self.room.take() {
            let _ = room.leave(self.id).await;
        }
    }
}

fn not_in_room() -> RoomError {
    RoomError::Validation("not in a room".to_string())
}
