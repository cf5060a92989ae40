use std::fmt::{Debug, Display, Formatter};
use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Identifies the publication (writer) a sample belongs to. Fragment reassembly on the
///  receiving side is per publication.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PublicationId(pub u64);

impl Debug for PublicationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}
impl Display for PublicationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    SampleData = 0,
    /// Sent before a link is released, so the peer does not try to reconnect
    GracefulDisconnect = 1,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MessageFlags: u8 {
        /// The message carries a fragment of a sample that was too big for a single message
        const FRAGMENTED = 0b001;
        const FIRST_FRAGMENT = 0b010;
        const LAST_FRAGMENT = 0b100;
    }
}

/// Header of a single message inside a packet, followed by `payload_len` bytes of payload:
/// ```ascii
///  0: message kind (u8)
///  1: flags (u8)
///  2: publication id (u64)
/// 10: payload length (u32)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub publication_id: PublicationId,
    pub payload_len: u32,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 14;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        buf.put_u8(self.flags.bits());
        buf.put_u64(self.publication_id.0);
        buf.put_u32(self.payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete message header");
        }

        let raw_kind = buf.get_u8();
        let kind = MessageKind::try_from(raw_kind)
            .map_err(|_| anyhow!("unknown message kind {}", raw_kind))?;
        let raw_flags = buf.get_u8();
        let flags = MessageFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("unknown message flags {:#x}", raw_flags))?;

        Ok(MessageHeader {
            kind,
            flags,
            publication_id: PublicationId(buf.get_u64()),
            payload_len: buf.get_u32(),
        })
    }
}
