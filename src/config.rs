//! Runtime configuration
//!
//! Read from environment variables (a `.env` file is loaded by `main`).

use std::time::Duration;

use crate::error::ConfigError;

/// Default bind host
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default listen port
pub const DEFAULT_PORT: u16 = 3000;
/// Default timeout for a single store call made by a room
pub const DEFAULT_PERSIST_TIMEOUT_MS: u64 = 5_000;
/// Default per-room event queue size
pub const DEFAULT_ROOM_MAILBOX_CAPACITY: usize = 256;
/// Default per-client outbound queue size
pub const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` the relay listens on
    pub listen_addr: String,
    /// Expiry is reported as a persistence error
    pub persist_timeout: Duration,
    pub room_mailbox_capacity: usize,
    pub client_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            persist_timeout: Duration::from_millis(DEFAULT_PERSIST_TIMEOUT_MS),
            room_mailbox_capacity: DEFAULT_ROOM_MAILBOX_CAPACITY,
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    /// Load from the process environment
    ///
    /// Recognised: `HOST`, `PORT`, `PERSIST_TIMEOUT_MS`,
    /// `ROOM_MAILBOX_CAPACITY`, `CLIENT_CHANNEL_CAPACITY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port: u16 = parse_or(&lookup, "PORT", DEFAULT_PORT)?;
        let timeout_ms: u64 = parse_or(&lookup, "PERSIST_TIMEOUT_MS", DEFAULT_PERSIST_TIMEOUT_MS)?;

        Ok(Self {
            listen_addr: format!("{}:{}", host, port),
            persist_timeout: Duration::from_millis(timeout_ms),
            room_mailbox_capacity: parse_nonzero(
                &lookup,
                "ROOM_MAILBOX_CAPACITY",
                DEFAULT_ROOM_MAILBOX_CAPACITY,
            )?,
            client_channel_capacity: parse_nonzero(
                &lookup,
                "CLIENT_CHANNEL_CAPACITY",
                DEFAULT_CLIENT_CHANNEL_CAPACITY,
            )?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

// mpsc::channel panics on a zero capacity
fn parse_nonzero<F>(lookup: &F, key: &'static str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}
