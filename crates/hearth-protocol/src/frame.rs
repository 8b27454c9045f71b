//! The closed set of protocol frames.
//!
//! Every message on the wire is one [`Frame`] variant. The numeric
//! [`FrameType`] tag travels in the frame header; the variant's fields
//! travel in the body. Adding a frame type means adding a variant here and
//! a tag in [`FrameType`], and the compiler points at every `match` that
//! has to learn about it.

use serde::{Deserialize, Serialize};

use crate::{
    ChannelId, ChannelInfo, ErrorCode, Image, MessageId, MessageRecord, UserId, UserSummary,
};

/// One protocol message.
///
/// `#[serde(tag = "type", content = "body")]` gives every variant the JSON
/// shape `{ "type": "Login", "body": { ... } }`. The framing codec puts the
/// `type` in the binary header and only the `body` object on the wire.
/// All variants are struct-like (`Logout {}` rather than `Logout`) so every
/// body is a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Frame {
    // -- Client → Server: authentication --
    /// Create an account and log in with it.
    Register { username: String, password: String },
    /// Log in to an existing account.
    Login { username: String, password: String },

    // -- Client → Server: authenticated requests --
    ChannelCreate { name: String },
    ChannelJoin { channel_id: ChannelId },
    ChannelLeave { channel_id: ChannelId },
    ChannelList {},
    /// Request a page of a channel's log, newest first.
    History {
        channel_id: ChannelId,
        #[serde(default)]
        before: Option<MessageId>,
        #[serde(default)]
        limit: Option<u32>,
    },
    MessageSend { channel_id: ChannelId, body: String },
    /// Post a picture, with an optional caption.
    ImageSend {
        channel_id: ChannelId,
        #[serde(default)]
        caption: String,
        image: Image,
    },
    SetDisplayName { display_name: String },
    Heartbeat { client_time: u64 },
    Logout {},

    // -- Server → Client --
    AuthOk {
        user: UserSummary,
        /// Users online at the moment of login, excluding the new session.
        online: Vec<UserSummary>,
    },
    AuthError { reason: String },
    ChannelCreated { channel: ChannelInfo },
    ChannelJoined { channel: ChannelInfo },
    ChannelLeft { channel_id: ChannelId },
    Channels { channels: Vec<ChannelInfo> },
    HistoryPage {
        channel_id: ChannelId,
        messages: Vec<MessageRecord>,
    },
    MessageBroadcast { message: MessageRecord },
    ProfileUpdated { user: UserSummary },
    UserConnected { user: UserSummary },
    UserDisconnected { user_id: UserId },
    HeartbeatAck { client_time: u64, server_time: u64 },
    Kicked { reason: String },
    Error { code: ErrorCode, message: String },
}

impl Frame {
    /// Returns the header tag for this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Register { .. } => FrameType::Register,
            Self::Login { .. } => FrameType::Login,
            Self::ChannelCreate { .. } => FrameType::ChannelCreate,
            Self::ChannelJoin { .. } => FrameType::ChannelJoin,
            Self::ChannelLeave { .. } => FrameType::ChannelLeave,
            Self::ChannelList {} => FrameType::ChannelList,
            Self::History { .. } => FrameType::History,
            Self::MessageSend { .. } => FrameType::MessageSend,
            Self::ImageSend { .. } => FrameType::ImageSend,
            Self::SetDisplayName { .. } => FrameType::SetDisplayName,
            Self::Heartbeat { .. } => FrameType::Heartbeat,
            Self::Logout {} => FrameType::Logout,
            Self::AuthOk { .. } => FrameType::AuthOk,
            Self::AuthError { .. } => FrameType::AuthError,
            Self::ChannelCreated { .. } => FrameType::ChannelCreated,
            Self::ChannelJoined { .. } => FrameType::ChannelJoined,
            Self::ChannelLeft { .. } => FrameType::ChannelLeft,
            Self::Channels { .. } => FrameType::Channels,
            Self::HistoryPage { .. } => FrameType::HistoryPage,
            Self::MessageBroadcast { .. } => FrameType::MessageBroadcast,
            Self::ProfileUpdated { .. } => FrameType::ProfileUpdated,
            Self::UserConnected { .. } => FrameType::UserConnected,
            Self::UserDisconnected { .. } => FrameType::UserDisconnected,
            Self::HeartbeatAck { .. } => FrameType::HeartbeatAck,
            Self::Kicked { .. } => FrameType::Kicked,
            Self::Error { .. } => FrameType::Error,
        }
    }

    /// Returns `true` if the frame may be dropped under backpressure.
    ///
    /// Only keep-alive traffic qualifies; losing one costs nothing but a
    /// slightly stale RTT estimate.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Heartbeat { .. } | Self::HeartbeatAck { .. })
    }

    /// Shorthand for an [`Frame::Error`] frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Numeric frame tag carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    Register = 0x0001,
    Login = 0x0002,
    ChannelCreate = 0x0010,
    ChannelJoin = 0x0011,
    ChannelLeave = 0x0012,
    ChannelList = 0x0013,
    History = 0x0014,
    MessageSend = 0x0020,
    ImageSend = 0x0021,
    SetDisplayName = 0x0030,
    Heartbeat = 0x0040,
    Logout = 0x0041,

    AuthOk = 0x0101,
    AuthError = 0x0102,
    ChannelCreated = 0x0110,
    ChannelJoined = 0x0111,
    ChannelLeft = 0x0112,
    Channels = 0x0113,
    HistoryPage = 0x0114,
    MessageBroadcast = 0x0120,
    ProfileUpdated = 0x0130,
    UserConnected = 0x0131,
    UserDisconnected = 0x0132,
    HeartbeatAck = 0x0140,
    Kicked = 0x0141,
    Error = 0x01FF,
}

impl FrameType {
    /// Every defined frame type, in tag order.
    pub const ALL: [FrameType; 26] = [
        Self::Register,
        Self::Login,
        Self::ChannelCreate,
        Self::ChannelJoin,
        Self::ChannelLeave,
        Self::ChannelList,
        Self::History,
        Self::MessageSend,
        Self::ImageSend,
        Self::SetDisplayName,
        Self::Heartbeat,
        Self::Logout,
        Self::AuthOk,
        Self::AuthError,
        Self::ChannelCreated,
        Self::ChannelJoined,
        Self::ChannelLeft,
        Self::Channels,
        Self::HistoryPage,
        Self::MessageBroadcast,
        Self::ProfileUpdated,
        Self::UserConnected,
        Self::UserDisconnected,
        Self::HeartbeatAck,
        Self::Kicked,
        Self::Error,
    ];

    /// Looks up a tag, honoring the version that introduced each type.
    ///
    /// Returns `None` for tags that are unknown, or that the given protocol
    /// version predates.
    pub fn from_tag(tag: u16, version: u16) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| *ty as u16 == tag)
            .filter(|ty| ty.since() <= version)
    }

    /// The numeric tag.
    pub fn tag(self) -> u16 {
        self as u16
    }

    /// The protocol version that introduced this frame type.
    pub fn since(self) -> u16 {
        1
    }

    /// The variant name, as used by the serde tag.
    pub fn name(self) -> &'static str {
        match self {
            Self::Register => "Register",
            Self::Login => "Login",
            Self::ChannelCreate => "ChannelCreate",
            Self::ChannelJoin => "ChannelJoin",
            Self::ChannelLeave => "ChannelLeave",
            Self::ChannelList => "ChannelList",
            Self::History => "History",
            Self::MessageSend => "MessageSend",
            Self::ImageSend => "ImageSend",
            Self::SetDisplayName => "SetDisplayName",
            Self::Heartbeat => "Heartbeat",
            Self::Logout => "Logout",
            Self::AuthOk => "AuthOk",
            Self::AuthError => "AuthError",
            Self::ChannelCreated => "ChannelCreated",
            Self::ChannelJoined => "ChannelJoined",
            Self::ChannelLeft => "ChannelLeft",
            Self::Channels => "Channels",
            Self::HistoryPage => "HistoryPage",
            Self::MessageBroadcast => "MessageBroadcast",
            Self::ProfileUpdated => "ProfileUpdated",
            Self::UserConnected => "UserConnected",
            Self::UserDisconnected => "UserDisconnected",
            Self::HeartbeatAck => "HeartbeatAck",
            Self::Kicked => "Kicked",
            Self::Error => "Error",
        }
    }
}
