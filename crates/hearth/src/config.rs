//! Server configuration.
//!
//! The server never reads files itself: whoever starts it builds a
//! [`ServerConfig`] (by hand, from the environment, or by deserializing
//! one) and hands it to [`ChatServerBuilder::config`](crate::ChatServerBuilder::config).

use std::path::PathBuf;

use hearth_protocol::DEFAULT_MAX_FRAME_SIZE;
use hearth_session::{DuplicateLoginPolicy, SessionConfig};
use hearth_store::DEFAULT_COST;
use serde::{Deserialize, Serialize};

/// Which byte stream clients connect with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Raw TCP; frames are written straight onto the stream.
    #[default]
    Tcp,
    /// WebSocket binary messages, for browser-hosted clients.
    WebSocket,
}

/// Where durable state lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseLocation {
    /// A private in-memory database, gone when the process exits.
    #[default]
    InMemory,
    /// A SQLite database file, created if missing.
    File(PathBuf),
}

/// Fully resolved server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `"0.0.0.0:7878"`.
    pub bind_addr: String,
    pub transport: TransportKind,
    pub database: DatabaseLocation,
    /// Largest frame body accepted from or sent to a peer, in bytes.
    pub max_frame_size: usize,
    pub duplicate_login: DuplicateLoginPolicy,
    /// bcrypt cost for new passwords. Clamped to what bcrypt accepts.
    pub password_cost: u32,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7878".to_string(),
            transport: TransportKind::default(),
            database: DatabaseLocation::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            duplicate_login: DuplicateLoginPolicy::default(),
            password_cost: DEFAULT_COST,
            session: SessionConfig::default(),
        }
    }
}
