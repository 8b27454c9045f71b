//! Unified error type for the hearth server.

use hearth_channel::ChannelError;
use hearth_protocol::{FrameError, ProtocolError};
use hearth_session::SessionError;
use hearth_store::StoreError;
use hearth_transport::TransportError;

/// Top-level error that wraps every layer's error.
///
/// The `#[from]` attribute on each variant generates the `From` impl, so
/// `?` converts a layer error into `HearthError` automatically.
#[derive(Debug, thiserror::Error)]
pub enum HearthError {
    /// Binding, accepting, reading or writing a connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Framing a byte stream.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Encoding or decoding a frame body.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Opening or querying the store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An illegal session transition or a refused login.
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
