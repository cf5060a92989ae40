use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

/// Identifies a channel: the peer's announced address, the transport priority and whether this
///  side initiates the connection. Two channels to the same peer with different priorities
///  use separate connections, and so do the initiating and the accepting side of a node that
///  connects to itself.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct LinkKey {
    pub remote_addr: SocketAddr,
    pub priority: u32,
    pub is_active: bool,
}

impl LinkKey {
    pub fn new(remote_addr: SocketAddr, priority: u32, is_active: bool) -> LinkKey {
        LinkKey { remote_addr, priority, is_active }
    }
}

impl Debug for LinkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}#{}", if self.is_active { "->" } else { "<-" }, self.remote_addr, self.priority)
    }
}
