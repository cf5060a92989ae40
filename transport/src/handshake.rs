use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use anyhow::bail;
use bytes::{Buf, BufMut};

/// The one-way handshake the initiator of a connection sends immediately after connecting:
///  it tells the acceptor which address (and priority) the connection belongs to, since the
///  acceptor only sees an ephemeral source port.
///
/// Fixed size, network byte order:
/// ```ascii
///  0: address family (u8): 4 or 6
///  1: reserved (u8), must be 0
///  2: port (u16)
///  4: address (16 bytes): IPv6 address, or IPv4 address padded with 12 zero bytes
/// 20: transport priority (u32)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakeMsg {
    pub self_addr: SocketAddr,
    pub priority: u32,
}

impl HandshakeMsg {
    pub const SERIALIZED_LEN: usize = 24;

    const FAMILY_V4: u8 = 4;
    const FAMILY_V6: u8 = 6;
    const ADDR_LEN: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut addr_bytes = [0u8; Self::ADDR_LEN];
        let family = match self.self_addr.ip() {
            IpAddr::V4(ip) => {
                addr_bytes[..4].copy_from_slice(&ip.octets());
                Self::FAMILY_V4
            }
            IpAddr::V6(ip) => {
                addr_bytes.copy_from_slice(&ip.octets());
                Self::FAMILY_V6
            }
        };

        buf.put_u8(family);
        buf.put_u8(0);
        buf.put_u16(self.self_addr.port());
        buf.put_slice(&addr_bytes);
        buf.put_u32(self.priority);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakeMsg> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated handshake: {} bytes instead of {}", buf.remaining(), Self::SERIALIZED_LEN);
        }

        let family = buf.get_u8();
        let reserved = buf.get_u8();
        let port = buf.get_u16();
        let mut addr_bytes = [0u8; Self::ADDR_LEN];
        buf.copy_to_slice(&mut addr_bytes);
        let priority = buf.get_u32();

        if reserved != 0 {
            bail!("malformed handshake: reserved byte is {}", reserved);
        }

        let ip = match family {
            Self::FAMILY_V4 => {
                if addr_bytes[4..].iter().any(|&b| b != 0) {
                    bail!("malformed handshake: IPv4 address with non-zero padding");
                }
                IpAddr::V4(Ipv4Addr::new(addr_bytes[0], addr_bytes[1], addr_bytes[2], addr_bytes[3]))
            }
            Self::FAMILY_V6 => IpAddr::V6(Ipv6Addr::from(addr_bytes)),
            other => bail!("malformed handshake: unknown address family {}", other),
        };

        if port == 0 || ip.is_unspecified() {
            bail!("malformed handshake: peer announced the non-routable address {:?}", SocketAddr::new(ip, port));
        }

        Ok(HandshakeMsg {
            self_addr: SocketAddr::new(ip, port),
            priority,
        })
    }
}
