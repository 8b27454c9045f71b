//! # hearth
//!
//! A chat server core: many concurrent peers, a login handshake, channels
//! with durable membership, and an append-only message log per channel.
//!
//! This crate wires the layers together and adds the protocol router:
//!
//! ```text
//! hearth-transport   bytes in and out (TCP, WebSocket)
//! hearth-protocol    frames and the wire codec
//! hearth-store       durable state (SQLite)
//! hearth-session     sessions and the online-user registry
//! hearth-channel     channel membership and online sets
//! hearth (this)      router, connection tasks, server loop
//! ```
//!
//! Start with [`ChatServer::builder`].

pub mod auth;
pub mod config;
mod connection;
mod error;
pub mod logging;
pub mod router;
mod server;

pub use config::{DatabaseLocation, ServerConfig, TransportKind};
pub use error::HearthError;
pub use router::{Flow, Router};
pub use server::{ChatServer, ChatServerBuilder, ShutdownHandle};

/// Convenient re-exports for building, running and talking to a server.
///
/// ```rust
/// use hearth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ChatServer, ChatServerBuilder, DatabaseLocation, HearthError, ServerConfig,
        ShutdownHandle, TransportKind,
    };

    pub use hearth_channel::{ChannelDirectory, ChannelError};
    pub use hearth_protocol::{
        ChannelId, ChannelInfo, Envelope, ErrorCode, Frame, FrameCodec, FrameError, FrameType,
        Image, MessageId, MessageRecord, PROTOCOL_VERSION, UserId, UserSummary,
    };
    pub use hearth_session::{
        CloseReason, DuplicateLoginPolicy, Session, SessionConfig, SessionRegistry, SessionState,
    };
    pub use hearth_store::{DEFAULT_COST, MIN_COST, SqliteStore, Store, StoreError};
    pub use hearth_transport::{TcpTransport, Transport, WebSocketTransport};
}
