use std::collections::VecDeque;
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use crate::listener::TransportListener;
use crate::message_header::{MessageHeader, PublicationId};
use crate::packet_header::PacketHeader;
use crate::safe_converter::SafeCast;
use crate::stream_socket::StreamSocket;

struct FakeSocketState {
    written: Vec<u8>,
    /// remaining number of bytes the socket accepts, `None` for unlimited
    write_capacity: Option<usize>,
    write_error: Option<ErrorKind>,
    incoming: VecDeque<u8>,
    peer_closed: bool,
    closed: bool,
}

/// An in-memory [StreamSocket] with controllable backpressure and failures
pub struct FakeSocket {
    state: Mutex<FakeSocketState>,
    changed: Notify,
}

impl FakeSocket {
    pub fn new() -> Arc<FakeSocket> {
        Arc::new(FakeSocket {
            state: Mutex::new(FakeSocketState {
                written: Vec::new(),
                write_capacity: None,
                write_error: None,
                incoming: VecDeque::new(),
                peer_closed: false,
                closed: false,
            }),
            changed: Notify::new(),
        })
    }

    pub fn with_write_capacity(capacity: usize) -> Arc<FakeSocket> {
        let result = Self::new();
        result.set_write_capacity(Some(capacity));
        result
    }

    pub fn set_write_capacity(&self, capacity: Option<usize>) {
        self.state.lock().unwrap().write_capacity = capacity;
        self.changed.notify_waiters();
    }

    pub fn fail_writes(&self, kind: ErrorKind) {
        self.state.lock().unwrap().write_error = Some(kind);
        self.changed.notify_waiters();
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn push_incoming(&self, data: &[u8]) {
        self.state.lock().unwrap().incoming.extend(data);
        self.changed.notify_waiters();
    }

    pub fn close_from_peer(&self) {
        self.state.lock().unwrap().peer_closed = true;
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn is_writable(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.closed || state.write_error.is_some() || state.write_capacity != Some(0)
    }

    fn is_readable(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.closed || state.peer_closed || !state.incoming.is_empty()
    }
}

#[async_trait]
impl StreamSocket for FakeSocket {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(ErrorKind::BrokenPipe.into());
        }
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }

        let n = match state.write_capacity {
            Some(0) => return Err(ErrorKind::WouldBlock.into()),
            Some(capacity) => usize::min(capacity, buf.len()),
            None => buf.len(),
        };
        if let Some(capacity) = state.write_capacity.as_mut() {
            *capacity -= n;
        }
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    async fn writable(&self) -> io::Result<()> {
        loop {
            let notified = self.changed.notified();
            if self.is_writable() {
                return Ok(());
            }
            notified.await;
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.incoming.is_empty() {
            return if state.closed || state.peer_closed {
                Ok(0)
            }
            else {
                Err(ErrorKind::WouldBlock.into())
            };
        }

        let n = usize::min(buf.len(), state.incoming.len());
        for (i, b) in state.incoming.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }

    async fn readable(&self) -> io::Result<()> {
        loop {
            let notified = self.changed.notified();
            if self.is_readable() {
                return Ok(());
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.changed.notify_waiters();
    }
}

/// Splits a byte stream written by a send strategy into packets and messages
pub fn decode_packets(mut buf: &[u8]) -> Vec<(PacketHeader, Vec<(MessageHeader, Bytes)>)> {
    let mut result = Vec::new();
    while !buf.is_empty() {
        let header = PacketHeader::deser(&mut buf).unwrap();
        let mut messages = Vec::new();
        for _ in 0..header.message_count {
            let message_header = MessageHeader::deser(&mut buf).unwrap();
            let len: usize = message_header.payload_len.safe_cast();
            messages.push((message_header, Bytes::copy_from_slice(&buf[..len])));
            buf = &buf[len..];
        }
        result.push((header, messages));
    }
    result
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    Established(SocketAddr),
    Disconnected(SocketAddr),
    Reconnected(SocketAddr),
    Lost(SocketAddr),
}

#[derive(Default)]
struct Recorded {
    events: Vec<ChannelEvent>,
    samples: Vec<(PublicationId, Bytes, SocketAddr)>,
}

/// Records everything the transport reports, with helpers to wait for specific notifications
#[derive(Default)]
pub struct RecordingListener {
    recorded: Mutex<Recorded>,
    changed: Notify,
}

impl RecordingListener {
    pub fn new() -> Arc<RecordingListener> {
        Default::default()
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.recorded.lock().unwrap().events.clone()
    }

    pub fn samples(&self) -> Vec<(PublicationId, Bytes, SocketAddr)> {
        self.recorded.lock().unwrap().samples.clone()
    }

    pub fn count_events(&self, predicate: impl Fn(&ChannelEvent) -> bool) -> usize {
        self.recorded.lock().unwrap().events.iter()
            .filter(|e| predicate(e))
            .count()
    }

    /// Waits (bounded by `timeout`) until the condition holds, returning whether it does
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&RecordingListener) -> bool) -> bool {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.changed.notified();
                if condition(self) {
                    return;
                }
                notified.await;
            }
        }).await;
        result.is_ok()
    }

    fn record_event(&self, event: ChannelEvent) {
        self.recorded.lock().unwrap().events.push(event);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl TransportListener for RecordingListener {
    async fn on_bytes_received(&self, payload: Bytes, publication_id: PublicationId, source_addr: SocketAddr) {
        self.recorded.lock().unwrap().samples.push((publication_id, payload, source_addr));
        self.changed.notify_waiters();
    }

    async fn on_channel_established(&self, remote_addr: SocketAddr) {
        self.record_event(ChannelEvent::Established(remote_addr));
    }

    async fn on_channel_disconnected(&self, remote_addr: SocketAddr) {
        self.record_event(ChannelEvent::Disconnected(remote_addr));
    }

    async fn on_channel_reconnected(&self, remote_addr: SocketAddr) {
        self.record_event(ChannelEvent::Reconnected(remote_addr));
    }

    async fn on_channel_lost(&self, remote_addr: SocketAddr) {
        self.record_event(ChannelEvent::Lost(remote_addr));
    }
}
