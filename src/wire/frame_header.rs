use bytes::{Buf, BufMut};

use crate::wire::message::DecodeError;

/// shard byte value for frames that belong to no shard
pub const NO_SHARD: u8 = 0xff;

/// The fixed-size header preceding every frame, both on TCP and UDP. All integers are
///  little-endian:
///
/// ```ascii
/// 0: seq_no (u64)
/// 8: nanos since last heartbeat (u32)
/// 12: body length (u16)
/// 14: message type (u8)
/// 15: shard (u8)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub seq_no: u64,
    pub nanos_since_heartbeat: u32,
    /// length of the body, i.e. excluding the header itself
    pub len: u16,
    pub msg_type: u8,
    pub shard: u8,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.seq_no);
        buf.put_u32_le(self.nanos_since_heartbeat);
        buf.put_u16_le(self.len);
        buf.put_u8(self.msg_type);
        buf.put_u8(self.shard);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<FrameHeader, DecodeError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(DecodeError::TruncatedHeader { available: buf.remaining() });
        }

        Ok(FrameHeader {
            seq_no: buf.get_u64_le(),
            nanos_since_heartbeat: buf.get_u32_le(),
            len: buf.get_u16_le(),
            msg_type: buf.get_u8(),
            shard: buf.get_u8(),
        })
    }
}
