use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::channel::ChannelId;
use crate::wire::frame_header::{FrameHeader, NO_SHARD};

/// width of the NUL padded username / password fields in a login message
pub const FIXED_STRING_LEN: usize = 32;
/// width of the NUL padded channel id field
pub const FIXED_ID_LEN: usize = 8;

/// Message type codes reserved for protocol control messages. All other codes are application
///  data and opaque to the protocol.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ControlType {
    Heartbeat = 22,
    /// internal wake-up for ingest loops, never valid on the wire
    Wake = 23,
    EndOfSnapshot = 24,
    Login = 25,
    ResendRequest = 26,
}

impl ControlType {
    pub fn body_len(self) -> usize {
        match self {
            ControlType::Heartbeat => 12,
            ControlType::Wake => FIXED_ID_LEN,
            ControlType::EndOfSnapshot => FIXED_ID_LEN + 8 + 1,
            ControlType::Login => 2 * FIXED_STRING_LEN,
            ControlType::ResendRequest => 12,
        }
    }

    pub fn is_control(msg_type: u8) -> bool {
        ControlType::try_from(msg_type).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame header: {available} bytes")]
    TruncatedHeader { available: usize },
    #[error("truncated frame body: header declares {declared} bytes, {available} available")]
    TruncatedBody { declared: usize, available: usize },
    #[error("{msg_type:?} requires a body of {expected} bytes, header declares {actual}")]
    BodyLength { msg_type: ControlType, expected: usize, actual: usize },
    #[error("{0:?} is not valid on the wire")]
    NotOnWire(ControlType),
    #[error("invalid {0}")]
    InvalidField(&'static str),
}

/// The typed interpretation of a control frame's body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `stamp` is the sender's wall clock as time since the Unix epoch
    Heartbeat { stamp: Duration },
    EndOfSnapshot { id: ChannelId, seq_no: u64, ok: bool },
    Login { username: String, password: String },
    ResendRequest { seq_no: u64, count: u32 },
}

impl ControlMessage {
    pub fn control_type(&self) -> ControlType {
        match self {
            ControlMessage::Heartbeat { .. } => ControlType::Heartbeat,
            ControlMessage::EndOfSnapshot { .. } => ControlType::EndOfSnapshot,
            ControlMessage::Login { .. } => ControlType::Login,
            ControlMessage::ResendRequest { .. } => ControlType::ResendRequest,
        }
    }

    fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ControlMessage::Heartbeat { stamp } => {
                buf.put_i64_le(stamp.as_secs().try_into().unwrap_or(i64::MAX));
                buf.put_u32_le(stamp.subsec_nanos());
            }
            ControlMessage::EndOfSnapshot { id, seq_no, ok } => {
                put_fixed_str(buf, id.as_str(), FIXED_ID_LEN);
                buf.put_u64_le(*seq_no);
                buf.put_u8(*ok as u8);
            }
            ControlMessage::Login { username, password } => {
                put_fixed_str(buf, username, FIXED_STRING_LEN);
                put_fixed_str(buf, password, FIXED_STRING_LEN);
            }
            ControlMessage::ResendRequest { seq_no, count } => {
                buf.put_u64_le(*seq_no);
                buf.put_u32_le(*count);
            }
        }
    }

    /// `buf` is known to contain exactly the body length required by `control_type`
    fn deser(control_type: ControlType, mut buf: &[u8]) -> Result<ControlMessage, DecodeError> {
        match control_type {
            ControlType::Heartbeat => {
                let secs = buf.get_i64_le();
                let nanos = buf.get_u32_le();
                if secs < 0 || nanos >= 1_000_000_000 {
                    return Err(DecodeError::InvalidField("heartbeat stamp"));
                }
                Ok(ControlMessage::Heartbeat { stamp: Duration::new(secs as u64, nanos) })
            }
            ControlType::Wake => Err(DecodeError::NotOnWire(ControlType::Wake)),
            ControlType::EndOfSnapshot => {
                let id = get_fixed_str(&mut buf, FIXED_ID_LEN, "channel id")?;
                let seq_no = buf.get_u64_le();
                let ok = buf.get_u8() != 0;
                Ok(ControlMessage::EndOfSnapshot { id: ChannelId::new(id), seq_no, ok })
            }
            ControlType::Login => {
                let username = get_fixed_str(&mut buf, FIXED_STRING_LEN, "username")?;
                let password = get_fixed_str(&mut buf, FIXED_STRING_LEN, "password")?;
                Ok(ControlMessage::Login { username, password })
            }
            ControlType::ResendRequest => {
                let seq_no = buf.get_u64_le();
                let count = buf.get_u32_le();
                Ok(ControlMessage::ResendRequest { seq_no, count })
            }
        }
    }
}

fn put_fixed_str(buf: &mut impl BufMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

fn get_fixed_str(buf: &mut &[u8], width: usize, field: &'static str) -> Result<String, DecodeError> {
    let raw = &buf[..width];
    buf.advance(width);

    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8(raw[..end].to_vec())
        .map_err(|_| DecodeError::InvalidField(field))
}

/// A single protocol frame: header plus (opaque or control) body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    /// An application data frame. Sequence number and heartbeat offset are stamped by the
    ///  publisher link sending it.
    pub fn data(msg_type: u8, shard: u8, body: impl Into<Bytes>) -> anyhow::Result<Frame> {
        if ControlType::is_control(msg_type) {
            bail!("message type {} is reserved for control messages", msg_type);
        }

        let body = body.into();
        let len = u16::try_from(body.len())
            .map_err(|_| anyhow!("frame body of {} bytes exceeds the maximum of {}", body.len(), u16::MAX))?;

        Ok(Frame {
            header: FrameHeader {
                seq_no: 0,
                nanos_since_heartbeat: 0,
                len,
                msg_type,
                shard,
            },
            body,
        })
    }

    pub fn control(message: &ControlMessage, seq_no: u64) -> Frame {
        let control_type = message.control_type();

        let mut body = BytesMut::with_capacity(control_type.body_len());
        message.ser(&mut body);
        debug_assert_eq!(body.len(), control_type.body_len());

        Frame {
            header: FrameHeader {
                seq_no,
                nanos_since_heartbeat: 0,
                // control bodies are small fixed-size structures
                len: body.len() as u16,
                msg_type: control_type.into(),
                shard: NO_SHARD,
            },
            body: body.freeze(),
        }
    }

    pub fn seq_no(&self) -> u64 {
        self.header.seq_no
    }

    pub fn msg_type(&self) -> u8 {
        self.header.msg_type
    }

    pub fn shard(&self) -> u8 {
        self.header.shard
    }

    pub fn is_control(&self) -> bool {
        ControlType::is_control(self.header.msg_type)
    }

    pub fn encoded_len(&self) -> usize {
        FrameHeader::SERIALIZED_LEN + self.body.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        self.header.ser(buf);
        buf.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Decodes a frame from the start of `buf`, validating the declared body length against
    ///  the available bytes. Trailing bytes beyond the declared length are ignored.
    pub fn decode(buf: &[u8]) -> Result<Frame, DecodeError> {
        let mut b = buf;
        let header = FrameHeader::deser(&mut b)?;

        let declared = header.len as usize;
        if b.len() < declared {
            return Err(DecodeError::TruncatedBody { declared, available: b.len() });
        }

        Ok(Frame {
            header,
            body: Bytes::copy_from_slice(&b[..declared]),
        })
    }

    /// Interprets the body of a control frame. Data frames yield `None` - their body is opaque
    ///  at this level.
    pub fn control_message(&self) -> Result<Option<ControlMessage>, DecodeError> {
        let control_type = match ControlType::try_from(self.header.msg_type) {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };

        if control_type == ControlType::Wake {
            return Err(DecodeError::NotOnWire(control_type));
        }

        let expected = control_type.body_len();
        if self.header.len as usize != expected || self.body.len() != expected {
            return Err(DecodeError::BodyLength {
                msg_type: control_type,
                expected,
                actual: self.header.len as usize,
            });
        }

        ControlMessage::deser(control_type, &self.body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::heartbeat(ControlMessage::Heartbeat { stamp: Duration::new(1_700_000_000, 123_456_789) })]
    #[case::end_of_snapshot(ControlMessage::EndOfSnapshot { id: ChannelId::new("md1"), seq_no: 4711, ok: true })]
    #[case::end_of_snapshot_failed(ControlMessage::EndOfSnapshot { id: ChannelId::new("12345678"), seq_no: 1, ok: false })]
    #[case::login(ControlMessage::Login { username: "user".to_string(), password: "secret".to_string() })]
    #[case::login_empty(ControlMessage::Login { username: "".to_string(), password: "".to_string() })]
    #[case::resend_request(ControlMessage::ResendRequest { seq_no: 21, count: 10 })]
    fn test_control_frame(#[case] message: ControlMessage) {
        let frame = Frame::control(&message, 99);
        assert_eq!(frame.header.len as usize, message.control_type().body_len());
        assert_eq!(frame.shard(), NO_SHARD);

        let decoded = Frame::decode(&frame.to_bytes()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.seq_no(), 99);
        assert_eq!(decoded.control_message().unwrap(), Some(message));
    }

    #[test]
    fn test_data_frame() {
        let frame = Frame::data(3, 7, vec![1u8, 2, 3]).unwrap();
        let decoded = Frame::decode(&frame.to_bytes()).unwrap();

        assert_eq!(decoded.msg_type(), 3);
        assert_eq!(decoded.shard(), 7);
        assert_eq!(decoded.body.as_ref(), &[1, 2, 3]);
        assert!(!decoded.is_control());
        assert_eq!(decoded.control_message(), Ok(None));
    }

    #[rstest]
    #[case::heartbeat(22)]
    #[case::wake(23)]
    #[case::resend_request(26)]
    fn test_data_frame_rejects_control_type(#[case] msg_type: u8) {
        assert!(Frame::data(msg_type, NO_SHARD, vec![]).is_err());
    }

    #[test]
    fn test_data_frame_too_long() {
        assert!(Frame::data(1, NO_SHARD, vec![0u8; u16::MAX as usize + 1]).is_err());
        assert!(Frame::data(1, NO_SHARD, vec![0u8; u16::MAX as usize]).is_ok());
    }

    #[test]
    fn test_decode_truncated_body() {
        let bytes = Frame::data(1, NO_SHARD, vec![9u8; 10]).unwrap().to_bytes();
        assert_eq!(Frame::decode(&bytes[..20]), Err(DecodeError::TruncatedBody { declared: 10, available: 4 }));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = Frame::data(1, NO_SHARD, vec![9u8; 3]).unwrap().to_bytes().to_vec();
        bytes.extend_from_slice(&[7, 7]);

        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.body.as_ref(), &[9, 9, 9]);
    }

    #[rstest]
    #[case::too_short(ControlType::ResendRequest, 11)]
    #[case::too_long(ControlType::ResendRequest, 13)]
    #[case::login(ControlType::Login, 12)]
    #[case::heartbeat(ControlType::Heartbeat, 0)]
    fn test_control_body_length_mismatch(#[case] control_type: ControlType, #[case] len: usize) {
        let frame = Frame {
            header: FrameHeader { seq_no: 1, nanos_since_heartbeat: 0, len: len as u16, msg_type: control_type.into(), shard: NO_SHARD },
            body: Bytes::from(vec![0u8; len]),
        };
        assert_eq!(frame.control_message(), Err(DecodeError::BodyLength { msg_type: control_type, expected: control_type.body_len(), actual: len }));
    }

    #[test]
    fn test_wake_is_not_on_wire() {
        let frame = Frame {
            header: FrameHeader { seq_no: 1, nanos_since_heartbeat: 0, len: FIXED_ID_LEN as u16, msg_type: ControlType::Wake.into(), shard: NO_SHARD },
            body: Bytes::from(vec![0u8; FIXED_ID_LEN]),
        };
        assert_eq!(frame.control_message(), Err(DecodeError::NotOnWire(ControlType::Wake)));
    }

    #[test]
    fn test_invalid_heartbeat_stamp() {
        let mut body = BytesMut::new();
        body.put_i64_le(-1);
        body.put_u32_le(0);
        let frame = Frame {
            header: FrameHeader { seq_no: 1, nanos_since_heartbeat: 0, len: 12, msg_type: ControlType::Heartbeat.into(), shard: NO_SHARD },
            body: body.freeze(),
        };
        assert_eq!(frame.control_message(), Err(DecodeError::InvalidField("heartbeat stamp")));
    }

    #[test]
    fn test_login_invalid_utf8() {
        let mut body = vec![0u8; 2 * FIXED_STRING_LEN];
        body[0] = 0xff;
        let frame = Frame {
            header: FrameHeader { seq_no: 0, nanos_since_heartbeat: 0, len: body.len() as u16, msg_type: ControlType::Login.into(), shard: NO_SHARD },
            body: Bytes::from(body),
        };
        assert_eq!(frame.control_message(), Err(DecodeError::InvalidField("username")));
    }
}
