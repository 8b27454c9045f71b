//! Wire protocol for hearth.
//!
//! This crate defines what chat clients and the server say to each other:
//!
//! - **Types** ([`UserId`], [`ChannelInfo`], [`MessageRecord`], etc.):
//!   the records that travel inside frames.
//! - **Frames** ([`Frame`], [`FrameType`]): the closed set of messages.
//! - **Framing** ([`FrameCodec`]): the 12-byte header and length-prefixed
//!   body that cut a byte stream into frames.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how a frame's body becomes
//!   bytes.
//!
//! # Architecture
//!
//! The protocol layer sits between transport (raw bytes) and session
//! (user identity). It knows nothing about sockets, accounts, or channels;
//! it only knows how to turn bytes into frames and back.
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → Session / Router (user context)
//! ```

mod codec;
mod error;
mod frame;
mod types;
mod wire;

pub use codec::{Codec, JsonCodec};
pub use error::{FrameError, ProtocolError};
pub use frame::{Frame, FrameType};
pub use types::{
    ChannelId, ChannelInfo, ErrorCode, Image, MessageId, MessageRecord, UserId, UserSummary,
};
pub use wire::{
    DEFAULT_MAX_FRAME_SIZE, Envelope, FrameCodec, HEADER_LEN, MAGIC, PROTOCOL_VERSION,
};
