//! Chat relay - Entry Point
//!
//! Loads configuration, starts the relay server, and runs until Ctrl-C.

use std::env;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::{AppError, Config, MemoryStore, RelayServer};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Optional .env file; real environment variables take precedence
    let dotenv_loaded = dotenv::dotenv().is_ok();

    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    if !dotenv_loaded {
        info!("No .env file found, using process environment");
    }

    let mut config = Config::from_env()?;

    // A bind address on the command line overrides HOST/PORT
    if let Some(addr) = env::args().nth(1) {
        config.listen_addr = addr;
    }

    let store = Arc::new(MemoryStore::new());
    let server = RelayServer::bind(config, store).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
