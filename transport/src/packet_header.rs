use anyhow::bail;
use bytes::{Buf, BufMut};

/// Header of a packet, i.e. the unit that the send strategy writes to the socket in one go:
/// ```ascii
///  0: protocol version (u8)
///  1: reserved (u8)
///  2: message count (u16)
///  4: body length (u32) - number of bytes following the header
///  8: packet sequence number (u64)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub message_count: u16,
    pub body_len: u32,
    pub sequence_number: u64,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const SERIALIZED_LEN: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(0);
        buf.put_u16(self.message_count);
        buf.put_u32(self.body_len);
        buf.put_u64(self.sequence_number);
    }

    /// Overwrites a placeholder header at the start of a packet buffer once the packet's
    ///  contents are known
    pub fn patch_into(&self, packet_buf: &mut [u8]) {
        let mut target = &mut packet_buf[..Self::SERIALIZED_LEN];
        self.ser(&mut target);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete packet header");
        }

        let protocol_version = buf.get_u8();
        if protocol_version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", protocol_version);
        }
        let _reserved = buf.get_u8();

        Ok(PacketHeader {
            message_count: buf.get_u16(),
            body_len: buf.get_u32(),
            sequence_number: buf.get_u64(),
        })
    }
}
