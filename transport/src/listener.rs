use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use bytes::Bytes;
use crate::message_header::PublicationId;

/// The upward interface of the transport: application code (i.e. the pub/sub layer) implements
///  this to receive samples and learn about the state of its channels.
///
/// Callbacks are invoked from the transport's tasks. Implementations should return quickly and
///  must not wait for operations on the same channel to complete.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportListener: Send + Sync + 'static {
    /// A complete sample arrived. `source_addr` is the address the peer announced in its
    ///  handshake, i.e. the channel's remote address.
    async fn on_bytes_received(&self, payload: Bytes, publication_id: PublicationId, source_addr: SocketAddr);

    async fn on_channel_established(&self, remote_addr: SocketAddr);

    /// The channel's connection is down and the transport is trying to restore it
    async fn on_channel_disconnected(&self, remote_addr: SocketAddr);

    async fn on_channel_reconnected(&self, remote_addr: SocketAddr);

    /// The channel could not be restored and is permanently gone. This is called at most once
    ///  per loss.
    async fn on_channel_lost(&self, remote_addr: SocketAddr);
}
