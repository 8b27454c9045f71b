//! Body codecs: how a frame's fields become bytes.
//!
//! The framing layer ([`FrameCodec`](crate::FrameCodec)) owns the binary
//! header; a [`Codec`] owns only the body. Swapping the body format means
//! writing another `Codec` and plugging it into `FrameCodec<C>`, with no
//! change to the header or to anything above the protocol crate.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes bytes back.
///
/// `Send + Sync + 'static` because a codec lives inside every connection
/// task, and Tokio may move those between worker threads.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if the value cannot be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the bytes are malformed or do
    /// not match `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON via `serde_json`.
///
/// Bodies are UTF-8 JSON objects, easy to inspect in a packet capture.
///
/// ```rust
/// use hearth_protocol::{Codec, JsonCodec, UserId};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&UserId(7)).unwrap();
/// assert_eq!(bytes, b"7");
/// let back: UserId = codec.decode(&bytes).unwrap();
/// assert_eq!(back, UserId(7));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_decode_garbage_returns_decode_error() {
        let result: Result<serde_json::Value, _> = JsonCodec.decode(b"{not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_json_decode_wrong_shape_returns_decode_error() {
        let result: Result<u64, _> = JsonCodec.decode(b"\"text\"");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
