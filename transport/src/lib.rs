//! A reliable TCP transport for a publish / subscribe middleware. It carries opaque samples
//!  between nodes over long-lived TCP connections, and hides connection failures from the
//!  application as far as possible by transparently reconnecting.
//!
//! ## Design
//!
//! * A *channel* ([data_link::DataLink]) connects this node with a peer. There is one channel
//!   per remote address, transport priority and direction, shared by all associations between
//!   the two nodes, and it is released when its last association goes away.
//! * Each channel has exactly one side that *initiates* the TCP connection. The other side
//!   *accepts* it, and waits for it if it asks for the channel before the initiator connected
//!   ([transport::Transport::find_or_create_channel]).
//! * When a connection breaks, the initiator reconnects with exponential backoff while the
//!   acceptor waits (bounded by a timeout) for the initiator to come back. Only if that fails,
//!   the channel is reported as lost - and then exactly once.
//! * Sending never blocks the application: samples are written directly while the socket
//!   accepts them, and queued (in order) while it does not, or while the connection is being
//!   restored. Each sample gets exactly one notification whether it was delivered or dropped.
//! * Samples bigger than a configured size are fragmented and reassembled by the receiver.
//! * A channel that is released on purpose tells its peer, so the peer does not try to
//!   restore the connection.
//!
//! The transport runs on tokio. Per channel there is one task reading the socket and one task
//!  draining the send queue, and there is a single task accepting connections.
//!
//! ## Handshake
//!
//! The initiator sends a fixed-size record immediately after connecting, identifying the
//!  channel to the acceptor (which only sees an ephemeral port) - all numbers in network byte
//!  order (BE):
//!
//! ```ascii
//!  0: address family (u8): 4 or 6
//!  1: reserved (u8), must be 0
//!  2: port (u16)
//!  4: address (16 bytes): IPv6 address, or IPv4 address followed by 12 zero bytes
//! 20: transport priority (u32)
//! ```
//!
//! The address is the one the initiator is reachable at (i.e. its acceptor's public address),
//!  which makes channels from both sides of a pair of nodes match up.
//!
//! ## Packets
//!
//! After the handshake, the stream is a sequence of packets. A packet holds one or several
//!  messages and is always written from its start: if a connection breaks in the middle of a
//!  packet, the packet is written again on the new connection, and the receiver discards the
//!  incomplete packet it got on the old one.
//!
//! ```ascii
//! packet header:
//!  0: protocol version (u8) = 1
//!  1: reserved (u8)
//!  2: message count (u16)
//!  4: body length (u32) - the number of bytes after the header
//!  8: packet sequence number (u64)
//!
//! message header, followed by the payload:
//!  0: message kind (u8): 0 = sample data, 1 = graceful disconnect
//!  1: flags (u8): 0x1 = fragmented, 0x2 = first fragment, 0x4 = last fragment
//!  2: publication id (u64)
//! 10: payload length (u32)
//! ```
//!
//! Packet sequence numbers are informational: TCP guarantees order, and they only help
//!  diagnosing packets that were lost with a broken connection.

mod backoff;
pub mod config;
pub mod connection;
pub mod connector;
pub mod data_link;
pub mod delivery;
mod handshake;
pub mod link_key;
pub mod listener;
pub mod message_header;
mod packet_header;
mod pending_connections;
mod receive_strategy;
mod reconnect_checker;
pub mod reconnect_state;
mod safe_converter;
mod send_strategy;
pub mod stream_socket;
pub mod transport;

#[cfg(test)]
mod test_util;
