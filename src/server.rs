//! Relay server
//!
//! Accepts TCP connections and hands each one to a connection handler,
//! all sharing one room registry.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::registry::RoomRegistry;
use crate::store::MessageStore;

/// The real-time endpoint
pub struct RelayServer {
    listener: TcpListener,
    registry: RoomRegistry,
    config: Config,
}

impl RelayServer {
    /// Bind the listener and start the room registry
    pub async fn bind(config: Config, store: Arc<dyn MessageStore>) -> Result<Self, AppError> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let registry = RoomRegistry::spawn(store, config.clone());
        Ok(Self {
            listener,
            registry,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Accept connections until `shutdown` resolves, then dispose every room
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Chat relay listening on {}", self.config.listen_addr);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        let registry = self.registry.clone();
                        let capacity = self.config.client_channel_capacity;

                        // Spawn handler task for each connection
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registry, capacity).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.registry.shutdown().await;
        info!("Chat relay stopped");
    }

    /// Accept connections forever
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }
}
