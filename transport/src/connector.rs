use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::trace;
use crate::config::{SocketTuning, TransportConfig};
use crate::stream_socket::StreamSocket;

/// Opens outgoing streams. This is the seam between connection management and the actual
///  network, allowing tests to simulate unreachable peers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, remote_addr: SocketAddr) -> anyhow::Result<Arc<dyn StreamSocket>>;
}

pub struct TcpConnector {
    connect_timeout: Duration,
    tuning: SocketTuning,
}

impl TcpConnector {
    pub fn new(config: &TransportConfig) -> TcpConnector {
        TcpConnector {
            connect_timeout: config.connect_timeout,
            tuning: config.socket.clone(),
        }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(&self, remote_addr: SocketAddr) -> anyhow::Result<Arc<dyn StreamSocket>> {
        trace!("connecting to {:?}", remote_addr);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(remote_addr)).await
            .map_err(|_| anyhow!("timeout connecting to {:?}", remote_addr))??;
        apply_socket_tuning(&stream, &self.tuning)?;
        Ok(Arc::new(stream))
    }
}

/// Applies buffer sizes and the Nagle setting to a connected or accepted stream
pub fn apply_socket_tuning(stream: &TcpStream, tuning: &SocketTuning) -> anyhow::Result<()> {
    stream.set_nodelay(!tuning.enable_nagle_algorithm)?;

    let sock_ref = SockRef::from(stream);
    if let Some(size) = tuning.send_buffer_size {
        sock_ref.set_send_buffer_size(size)?;
    }
    if let Some(size) = tuning.receive_buffer_size {
        sock_ref.set_recv_buffer_size(size)?;
    }
    Ok(())
}
