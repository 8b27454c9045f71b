//! Length-prefixed framing over a byte stream.
//!
//! Every frame on the wire is a fixed 12-byte header followed by a body:
//!
//! ```text
//! +--------+---------+------+----------+------------------+
//! | magic  | version | type | body_len | body             |
//! | u32 BE | u16 BE  | u16  | u32 BE   | body_len bytes   |
//! +--------+---------+------+----------+------------------+
//! ```
//!
//! `magic` is `"HRTH"` and guards against a peer that is not speaking this
//! protocol at all. `type` is a [`FrameType`] tag. The body is whatever the
//! body [`Codec`] produced for the frame's fields.
//!
//! [`FrameCodec::decode`] works on a growing [`BytesMut`] read buffer: it
//! returns `Ok(None)` until a whole frame is buffered, and never consumes
//! a partial frame.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use crate::{Codec, Frame, FrameError, FrameType, JsonCodec, ProtocolError};

/// Protocol magic: ASCII `"HRTH"`.
pub const MAGIC: u32 = 0x4852_5448;

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Default cap on a single frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// A decoded frame together with the version it was sent with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u16,
    pub frame: Frame,
}

/// Splits a byte stream into [`Frame`]s and back.
///
/// Generic over the body codec; [`JsonCodec`] unless told otherwise.
#[derive(Debug, Clone)]
pub struct FrameCodec<C: Codec = JsonCodec> {
    codec: C,
    max_frame_size: usize,
}

impl Default for FrameCodec<JsonCodec> {
    fn default() -> Self {
        Self::new(JsonCodec)
    }
}

impl<C: Codec> FrameCodec<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Sets the largest body, in bytes, accepted in either direction.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Appends one encoded frame to `dst`.
    ///
    /// # Errors
    /// [`FrameError::Encode`] if the body codec fails, or
    /// [`FrameError::FrameTooLarge`] if the body would exceed the limit.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = self.encode_body(frame)?;
        if body.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        // The size check above bounds the body well below u32::MAX.
        let body_len = body.len() as u32;

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(MAGIC);
        dst.put_u16(PROTOCOL_VERSION);
        dst.put_u16(frame.frame_type().tag());
        dst.put_u32(body_len);
        dst.put_slice(&body);
        Ok(())
    }

    /// Size of `frame`'s body in bytes, whether or not it fits the limit.
    pub fn body_len(&self, frame: &Frame) -> Result<usize, FrameError> {
        Ok(self.encode_body(frame)?.len())
    }

    /// Returns `true` if `frame` can be sent without exceeding the limit.
    pub fn fits(&self, frame: &Frame) -> bool {
        self.body_len(frame)
            .is_ok_and(|len| len <= self.max_frame_size)
    }

    /// Size of one value as the body codec writes it, e.g. a single element
    /// of a frame's list field.
    pub fn value_len<T: Serialize>(&self, value: &T) -> Result<usize, FrameError> {
        self.codec
            .encode(value)
            .map(|bytes| bytes.len())
            .map_err(FrameError::Encode)
    }

    fn encode_body(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let mut tagged = serde_json::to_value(frame)
            .map_err(|e| FrameError::Encode(ProtocolError::Encode(e)))?;
        let body = tagged
            .get_mut("body")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        self.codec.encode(&body).map_err(FrameError::Encode)
    }

    /// Encodes a single frame into a fresh buffer.
    pub fn encode_to_vec(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let mut buf = BytesMut::new();
        self.encode(frame, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Tries to take one frame off the front of `src`.
    ///
    /// - `Ok(None)`: not enough bytes yet; `src` is untouched.
    /// - `Ok(Some(_))`: one frame was consumed.
    /// - `Err(e)` with `e.is_fatal()`: the stream is unusable.
    /// - `Err(e)` otherwise: one bad frame was consumed and the buffer is
    ///   aligned on the next header.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Envelope>, FrameError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if magic != MAGIC {
            return Err(FrameError::BadMagic {
                expected: MAGIC,
                actual: magic,
            });
        }
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = u16::from_be_bytes([src[4], src[5]]);
        let tag = u16::from_be_bytes([src[6], src[7]]);
        let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;

        if version == 0 || version > PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        if body_len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }
        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(body_len);

        let frame_type = FrameType::from_tag(tag, version)
            .ok_or(FrameError::UnknownFrameType { tag, version })?;
        let value: serde_json::Value =
            self.codec.decode(&body).map_err(FrameError::MalformedBody)?;
        let tagged = serde_json::json!({ "type": frame_type.name(), "body": value });
        let frame = serde_json::from_value(tagged)
            .map_err(|e| FrameError::MalformedBody(ProtocolError::Decode(e)))?;

        Ok(Some(Envelope { version, frame }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ChannelId, ChannelInfo, ErrorCode, Image, MessageId, MessageRecord, UserId, UserSummary,
    };

    // =========================================================================
    // Helpers
    // =========================================================================

    fn user(id: u64) -> UserSummary {
        UserSummary {
            id: UserId(id),
            display_name: format!("user{id}"),
        }
    }

    fn channel() -> ChannelInfo {
        ChannelInfo {
            id: ChannelId(1),
            name: "general".into(),
            owner: UserId(1),
            created_at: 1_700_000_000_000,
        }
    }

    fn message() -> MessageRecord {
        MessageRecord {
            id: MessageId(3),
            channel_id: ChannelId(1),
            author: UserId(2),
            body: "hi".into(),
            image: None,
            timestamp: 1_700_000_000_123,
        }
    }

    /// One instance of every frame type.
    fn every_frame() -> Vec<Frame> {
        vec![
            Frame::Register {
                username: "alice".into(),
                password: "pw".into(),
            },
            Frame::Login {
                username: "alice".into(),
                password: "pw".into(),
            },
            Frame::ChannelCreate {
                name: "general".into(),
            },
            Frame::ChannelJoin {
                channel_id: ChannelId(1),
            },
            Frame::ChannelLeave {
                channel_id: ChannelId(1),
            },
            Frame::ChannelList {},
            Frame::History {
                channel_id: ChannelId(1),
                before: Some(MessageId(10)),
                limit: None,
            },
            Frame::MessageSend {
                channel_id: ChannelId(1),
                body: "hello".into(),
            },
            Frame::ImageSend {
                channel_id: ChannelId(1),
                caption: "look".into(),
                image: Image {
                    width: 2,
                    height: 2,
                    data: vec![1, 2, 3, 4],
                },
            },
            Frame::SetDisplayName {
                display_name: "Alice".into(),
            },
            Frame::Heartbeat { client_time: 5 },
            Frame::Logout {},
            Frame::AuthOk {
                user: user(1),
                online: vec![user(2)],
            },
            Frame::AuthError {
                reason: "bad password".into(),
            },
            Frame::ChannelCreated { channel: channel() },
            Frame::ChannelJoined { channel: channel() },
            Frame::ChannelLeft {
                channel_id: ChannelId(1),
            },
            Frame::Channels {
                channels: vec![channel()],
            },
            Frame::HistoryPage {
                channel_id: ChannelId(1),
                messages: vec![message()],
            },
            Frame::MessageBroadcast { message: message() },
            Frame::ProfileUpdated { user: user(1) },
            Frame::UserConnected { user: user(2) },
            Frame::UserDisconnected { user_id: UserId(2) },
            Frame::HeartbeatAck {
                client_time: 5,
                server_time: 6,
            },
            Frame::Kicked {
                reason: "logged in elsewhere".into(),
            },
            Frame::error(ErrorCode::NotMember, "join first"),
        ]
    }

    fn header(version: u16, tag: u16, len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u16(version);
        buf.put_u16(tag);
        buf.put_u32(len);
        buf
    }

    // =========================================================================
    // Round trip
    // =========================================================================

    #[test]
    fn test_every_frame_type_round_trips() {
        let codec = FrameCodec::default();
        let frames = every_frame();
        assert_eq!(frames.len(), FrameType::ALL.len());

        for frame in frames {
            let mut buf = BytesMut::new();
            codec.encode(&frame, &mut buf).unwrap();
            let env = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(env.frame, frame);
            assert_eq!(env.version, PROTOCOL_VERSION);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_encode_writes_header_fields() {
        let codec = FrameCodec::default();
        let bytes = codec.encode_to_vec(&Frame::Logout {}).unwrap();
        assert_eq!(&bytes[0..4], b"HRTH");
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), PROTOCOL_VERSION);
        assert_eq!(
            u16::from_be_bytes([bytes[6], bytes[7]]),
            FrameType::Logout.tag()
        );
        assert_eq!(u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 2);
        assert_eq!(&bytes[HEADER_LEN..], b"{}");
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = FrameCodec::default();
        let frame = Frame::AuthOk {
            user: user(1),
            online: vec![user(2), user(3)],
        };
        assert_eq!(
            codec.encode_to_vec(&frame).unwrap(),
            codec.encode_to_vec(&frame).unwrap()
        );
    }

    // =========================================================================
    // Partial and batched input
    // =========================================================================

    #[test]
    fn test_decode_byte_at_a_time_yields_frame_once_complete() {
        let codec = FrameCodec::default();
        let frame = Frame::MessageSend {
            channel_id: ChannelId(1),
            body: "split across many reads".into(),
        };
        let bytes = codec.encode_to_vec(&frame).unwrap();

        let mut buf = BytesMut::new();
        for (i, byte) in bytes.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(result.is_none(), "decoded early at byte {i}");
                assert_eq!(buf.len(), i + 1, "partial frame was consumed");
            } else {
                assert_eq!(result.unwrap().frame, frame);
            }
        }
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(&Frame::ChannelList {}, &mut buf).unwrap();
        codec
            .encode(&Frame::Heartbeat { client_time: 9 }, &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.frame, Frame::ChannelList {});
        assert_eq!(second.frame, Frame::Heartbeat { client_time: 9 });
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[test]
    fn test_decode_bad_magic_is_fatal() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::BadMagic { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_oversized_declared_length_is_fatal() {
        let codec = FrameCodec::default().with_max_frame_size(16);
        let mut buf = header(PROTOCOL_VERSION, FrameType::Login.tag(), 17);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 17, max: 16 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_encode_oversized_body_returns_frame_too_large() {
        let codec = FrameCodec::default().with_max_frame_size(8);
        let frame = Frame::MessageSend {
            channel_id: ChannelId(1),
            body: "x".repeat(100),
        };
        let mut buf = BytesMut::new();
        let err = codec.encode(&frame, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_body_len_matches_encoded_body() {
        let codec = FrameCodec::default();
        let frame = Frame::HistoryPage {
            channel_id: ChannelId(1),
            messages: vec![message(), message()],
        };
        let encoded = codec.encode_to_vec(&frame).unwrap();
        assert_eq!(codec.body_len(&frame).unwrap(), encoded.len() - HEADER_LEN);
    }

    #[test]
    fn test_fits_reports_limit_without_erroring() {
        let frame = Frame::MessageSend {
            channel_id: ChannelId(1),
            body: "x".repeat(100),
        };
        let len = FrameCodec::default().body_len(&frame).unwrap();

        assert!(FrameCodec::default().with_max_frame_size(len).fits(&frame));
        assert!(!FrameCodec::default().with_max_frame_size(len - 1).fits(&frame));
    }

    #[test]
    fn test_page_size_is_overhead_plus_elements_and_commas() {
        let codec = FrameCodec::default();
        let empty = Frame::HistoryPage {
            channel_id: ChannelId(1),
            messages: vec![],
        };
        let full = Frame::HistoryPage {
            channel_id: ChannelId(1),
            messages: vec![message(), message(), message()],
        };
        let each = codec.value_len(&message()).unwrap();

        assert_eq!(
            codec.body_len(&full).unwrap(),
            codec.body_len(&empty).unwrap() + 3 * each + 2
        );
    }

    #[test]
    fn test_decode_unsupported_version_is_fatal() {
        let codec = FrameCodec::default();
        let mut buf = header(PROTOCOL_VERSION + 1, FrameType::Login.tag(), 0);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedVersion(v) if v == PROTOCOL_VERSION + 1));
    }

    #[test]
    fn test_decode_unknown_type_consumes_frame_and_recovers() {
        let codec = FrameCodec::default();
        let mut buf = header(PROTOCOL_VERSION, 0x7777, 2);
        buf.put_slice(b"{}");
        codec.encode(&Frame::Logout {}, &mut buf).unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::UnknownFrameType {
                tag: 0x7777,
                version: 1
            }
        ));
        assert!(!err.is_fatal());

        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.frame, Frame::Logout {});
    }

    #[test]
    fn test_decode_malformed_body_consumes_frame_and_recovers() {
        let codec = FrameCodec::default();
        let body = br#"{"channel_id":"not a number"}"#;
        let mut buf = header(
            PROTOCOL_VERSION,
            FrameType::ChannelJoin.tag(),
            body.len() as u32,
        );
        buf.put_slice(body);
        codec.encode(&Frame::ChannelList {}, &mut buf).unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MalformedBody(_)));
        assert!(!err.is_fatal());

        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.frame, Frame::ChannelList {});
    }

    #[test]
    fn test_decode_short_magic_prefix_waits() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"HR"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }
}
