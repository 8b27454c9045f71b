//! Error types for the protocol layer.
//!
//! Two enums live here. [`ProtocolError`] is what a body [`Codec`](crate::Codec)
//! reports when it cannot turn a value into bytes or back. [`FrameError`] is
//! what the framing layer reports while cutting a byte stream into frames.
//!
//! The framing errors split into two groups, and the connection handler
//! treats them differently:
//!
//! - **Fatal** ([`FrameError::is_fatal`]): the stream is no longer
//!   trustworthy (wrong magic, absurd length). There is no way to find the
//!   next frame boundary, so the connection has to go.
//! - **Recoverable**: the header was fine and the whole frame was consumed,
//!   but its content made no sense (unknown type, bad body). The stream is
//!   still aligned, so the caller may keep reading and count the offense.

/// Errors produced by a body [`Codec`](crate::Codec).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, wrong types.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// Deserialized fine but violates a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Errors produced while framing or unframing a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header did not start with the protocol magic.
    #[error("bad magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },

    /// The declared body length exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The peer speaks a protocol version this server does not.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    /// The type tag is unknown, or newer than the frame's version.
    #[error("unknown frame type {tag:#06x} for version {version}")]
    UnknownFrameType { tag: u16, version: u16 },

    /// The body did not decode into the frame its tag announced.
    #[error("malformed body: {0}")]
    MalformedBody(#[source] ProtocolError),

    /// Encoding an outbound frame failed.
    #[error("encode failed: {0}")]
    Encode(#[source] ProtocolError),
}

impl FrameError {
    /// Returns `true` if the stream can no longer be parsed.
    ///
    /// After a fatal error the read buffer is in an unknown state and the
    /// connection must be closed. Non-fatal errors consumed exactly one
    /// frame and left the buffer aligned on the next header.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BadMagic { .. }
                | Self::FrameTooLarge { .. }
                | Self::UnsupportedVersion(_)
        )
    }
}
