use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::io::ErrorKind;
use std::net::Shutdown;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::debug;

/// This is an abstraction for non-blocking I/O on a connected byte stream, introduced to
///  facilitate replacing real sockets in tests.
///
/// The `try_*` functions never block: they return `ErrorKind::WouldBlock` if the socket is not
///  ready, and callers wait for readiness using the corresponding async function.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamSocket: Send + Sync + 'static {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
    async fn writable(&self) -> io::Result<()>;

    /// `Ok(0)` signals that the peer closed the stream
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn readable(&self) -> io::Result<()>;

    /// Shuts down both directions. Pending readiness waits return, and following reads see EOF.
    fn close(&self);
}

#[async_trait]
impl StreamSocket for TcpStream {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    async fn writable(&self) -> io::Result<()> {
        TcpStream::writable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    fn close(&self) {
        if let Err(e) = SockRef::from(self).shutdown(Shutdown::Both) {
            // the peer may have reset the connection already
            debug!("error shutting down TCP stream: {}", e);
        }
    }
}

/// Writes all of `buf`, waiting for writability as often as necessary
pub async fn write_fully(socket: &dyn StreamSocket, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        socket.writable().await?;
        match socket.try_write(buf) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "stream does not accept data")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Fills all of `buf`, failing with `UnexpectedEof` if the stream ends before that
pub async fn read_exact(socket: &dyn StreamSocket, buf: &mut [u8]) -> io::Result<()> {
    let mut offs = 0;
    while offs < buf.len() {
        socket.readable().await?;
        match socket.try_read(&mut buf[offs..]) {
            Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "stream closed prematurely")),
            Ok(n) => offs += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
