//! Room-based real-time chat relay
//!
//! A WebSocket relay built with tokio-tungstenite that groups connected
//! clients by conversation, persists chat messages before broadcasting
//! them, and relays typing and presence events.
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `RoomRegistry` is an actor owning the conversation → room mapping,
//!   so a conversation never has more than one live room
//! - Each `Room` is an actor that handles its events one at a time, so a
//!   message is persisted and broadcast before the next event is looked at
//! - Each connection has a `handler` task forwarding client events to its room
//! - Rooms are independent and run in parallel
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use chat_relay::{Config, MemoryStore, RelayServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = RelayServer::bind(Config::default(), Arc::new(MemoryStore::new()))
//!         .await
//!         .unwrap();
//!     server.run().await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod formatter;
pub mod handler;
pub mod message;
pub mod model;
pub mod registry;
pub mod room;
pub mod server;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use client::Member;
pub use config::Config;
pub use error::{AppError, ConfigError, RoomError, SendError, StoreError};
pub use formatter::{format_message, FormattedMessage, SenderSummary};
pub use handler::handle_connection;
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use model::{Conversation, Message, PopulatedMessage, User};
pub use registry::RoomRegistry;
pub use room::{Room, RoomHandle, RoomSnapshot, RoomState};
pub use server::RelayServer;
pub use store::{MemoryStore, MessageStore};
pub use types::{ConversationId, MessageId, RoomId, SessionId, UserId};
