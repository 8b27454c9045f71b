//! Shared chat types that travel inside frames.
//!
//! Identity newtypes serialize as plain numbers (`#[serde(transparent)]`),
//! so a `UserId(42)` is just `42` on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Stable, immutable identifier of a user account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U-{}", self.0)
    }
}

/// Identifier of a channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C-{}", self.0)
    }
}

/// Identifier of a message within its channel.
///
/// Assigned by the store: strictly increasing and gap-free per channel,
/// starting at 1. It is the ordering key of the channel's log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Public view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: String,
}

/// Public view of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub owner: UserId,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// A picture attached to a message.
///
/// `data` is the encoded image file (PNG, JPEG, ...) and travels as
/// base64. The server checks the dimensions are non-zero but never decodes
/// the pixels.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub width: u16,
    pub height: u16,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

// Image bytes would swamp debug logs.
impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A persisted chat message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: UserId,
    /// Text, or an image's caption (possibly empty).
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    /// Milliseconds since the Unix epoch, assigned by the server.
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Error classification carried by [`Frame::Error`](crate::Frame::Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or out-of-state frame.
    ProtocolError,
    /// Bad credentials. The peer may retry.
    AuthError,
    /// Authentication was not completed in time.
    AuthTimeout,
    /// No inbound traffic for too long after authenticating.
    IdleTimeout,
    /// Too many malformed frames or failed logins.
    ProtocolAbuse,
    /// The peer's outbound queue overflowed.
    BackpressureOverflow,
    /// Referenced channel does not exist.
    NotFound,
    /// Already a member of the channel.
    AlreadyMember,
    /// Not a member of the channel.
    NotMember,
    /// The user already has a live session.
    AlreadyConnected,
    /// A channel with this name already exists.
    NameTaken,
    /// A request field failed validation.
    InvalidInput,
    /// A request or its reply does not fit in one frame.
    TooLarge,
    /// The durable store rejected the operation.
    PersistenceFailure,
    /// The server is shutting down.
    ShuttingDown,
}

impl ErrorCode {
    /// Returns `true` for codes that end the connection.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::ProtocolError
                | Self::AuthTimeout
                | Self::IdleTimeout
                | Self::ProtocolAbuse
                | Self::BackpressureOverflow
                | Self::ShuttingDown
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProtocolError => "protocol error",
            Self::AuthError => "authentication error",
            Self::AuthTimeout => "authentication timeout",
            Self::IdleTimeout => "idle timeout",
            Self::ProtocolAbuse => "protocol abuse",
            Self::BackpressureOverflow => "backpressure overflow",
            Self::NotFound => "not found",
            Self::AlreadyMember => "already a member",
            Self::NotMember => "not a member",
            Self::AlreadyConnected => "already connected",
            Self::NameTaken => "name taken",
            Self::InvalidInput => "invalid input",
            Self::TooLarge => "too large",
            Self::PersistenceFailure => "persistence failure",
            Self::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}
