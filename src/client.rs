//! Room member definition
//!
//! A session that has joined a room, with the user it speaks for and
//! its outbound message channel.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::{SessionId, UserId};

/// Joined session
#[derive(Debug, Clone)]
pub struct Member {
    /// Connection this member belongs to
    pub session_id: SessionId,
    /// User the session represents
    pub user_id: UserId,
    /// Room → Client message channel
    pub sender: mpsc::Sender<ServerMessage>,
}

impl Member {
    pub fn new(session_id: SessionId, user_id: UserId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            session_id,
            user_id,
            sender,
        }
    }

    /// Queue a message for this member without waiting
    ///
    /// Fails with `Full` when the client has stopped draining its queue,
    /// and with `ChannelClosed` once it has disconnected.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}
