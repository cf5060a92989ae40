use std::io::ErrorKind;
use std::sync::{Arc, Mutex, Weak};
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, trace, Instrument};
use uuid::Uuid;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::data_link::DataLink;
use crate::message_header::{MessageFlags, MessageHeader, MessageKind, PublicationId};
use crate::packet_header::PacketHeader;
use crate::safe_converter::SafeCast;
use crate::stream_socket::StreamSocket;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedSample {
    pub publication_id: PublicationId,
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    Data,
    WouldBlock,
    /// The peer closed the stream
    Eof,
}

#[derive(Default)]
struct ReceiveState {
    /// Bytes of a packet that was not completely received yet
    buf: BytesMut,
    reassembly: FxHashMap<PublicationId, BytesMut>,
    expected_sequence_number: Option<u64>,
    gracefully_disconnected: bool,
}

impl ReceiveState {
    /// Partially received data belongs to the previous socket: the sender writes the packet
    ///  again from its start on the new one
    fn reset_for_rebind(&mut self) {
        if !self.buf.is_empty() || !self.reassembly.is_empty() {
            debug!("discarding {} bytes of an incomplete packet and {} incomplete samples", self.buf.len(), self.reassembly.len());
        }
        self.buf.clear();
        self.reassembly.clear();
        self.gracefully_disconnected = false;
    }

    fn parse_packets(&mut self, config: &TransportConfig, received: &mut Vec<ReceivedSample>) -> anyhow::Result<()> {
        while self.buf.len() >= PacketHeader::SERIALIZED_LEN {
            let header = PacketHeader::deser(&mut &self.buf[..PacketHeader::SERIALIZED_LEN])?;

            let body_len: usize = header.body_len.safe_cast();
            let packet_len = PacketHeader::SERIALIZED_LEN + body_len;
            if packet_len > config.max_packet_size {
                bail!("packet of {} bytes exceeds the maximum packet size of {}", packet_len, config.max_packet_size);
            }
            if self.buf.len() < packet_len {
                break;
            }

            let mut packet = self.buf.split_to(packet_len).freeze();
            let _ = packet.split_to(PacketHeader::SERIALIZED_LEN);

            self.check_sequence_number(header.sequence_number);
            self.parse_messages(&header, packet, received)?;
        }
        Ok(())
    }

    fn check_sequence_number(&mut self, sequence_number: u64) {
        if let Some(expected) = self.expected_sequence_number {
            if sequence_number != expected {
                debug!("packet sequence number {} instead of {}: packets were lost with a previous connection", sequence_number, expected);
            }
        }
        self.expected_sequence_number = Some(sequence_number.wrapping_add(1));
    }

    fn parse_messages(&mut self, header: &PacketHeader, mut body: Bytes, received: &mut Vec<ReceivedSample>) -> anyhow::Result<()> {
        for _ in 0..header.message_count {
            let message_header = MessageHeader::deser(&mut body)?;
            let payload_len: usize = message_header.payload_len.safe_cast();
            if body.len() < payload_len {
                bail!("message length {} exceeds the remaining {} bytes of its packet", payload_len, body.len());
            }
            let payload = body.split_to(payload_len);
            self.on_message(message_header, payload, received);
        }

        if !body.is_empty() {
            bail!("{} unparsed bytes after the last message of a packet", body.len());
        }
        Ok(())
    }

    fn on_message(&mut self, header: MessageHeader, payload: Bytes, received: &mut Vec<ReceivedSample>) {
        let publication_id = header.publication_id;

        match header.kind {
            MessageKind::GracefulDisconnect => {
                debug!("peer announced graceful disconnect");
                self.gracefully_disconnected = true;
            }
            MessageKind::SampleData if !header.flags.contains(MessageFlags::FRAGMENTED) => {
                received.push(ReceivedSample { publication_id, payload });
            }
            MessageKind::SampleData => {
                if header.flags.contains(MessageFlags::FIRST_FRAGMENT) {
                    if self.reassembly.insert(publication_id, BytesMut::from(&payload[..])).is_some() {
                        debug!("discarding incomplete sample of {:?}", publication_id);
                    }
                }
                else {
                    match self.reassembly.get_mut(&publication_id) {
                        Some(buf) => buf.extend_from_slice(&payload),
                        None => {
                            debug!("dropping fragment of {:?} without a preceding first fragment", publication_id);
                            return;
                        }
                    }
                }

                if header.flags.contains(MessageFlags::LAST_FRAGMENT) {
                    if let Some(buf) = self.reassembly.remove(&publication_id) {
                        received.push(ReceivedSample { publication_id, payload: buf.freeze() });
                    }
                }
            }
        }
    }
}

/// Reads from a connection's socket and turns the byte stream back into samples, handing them
///  to the data link. There is one reader task per bound socket.
///
/// A packet's samples are delivered only after the complete packet was received.
pub struct ReceiveStrategy {
    config: Arc<TransportConfig>,
    link: Weak<DataLink>,
    link_id: Uuid,
    state: Mutex<ReceiveState>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiveStrategy {
    pub fn new(config: Arc<TransportConfig>, link: Weak<DataLink>, link_id: Uuid) -> Arc<ReceiveStrategy> {
        Arc::new(ReceiveStrategy {
            config,
            link,
            link_id,
            state: Default::default(),
            reader: Mutex::new(None),
        })
    }

    pub fn gracefully_disconnected(&self) -> bool {
        self.state.lock().unwrap().gracefully_disconnected
    }

    /// Performs a single non-blocking read, returning all samples that are complete afterwards.
    ///  Protocol violations are reported as errors, the stream is unusable after that.
    pub fn on_readable(&self, socket: &dyn StreamSocket) -> anyhow::Result<(ReadOutcome, Vec<ReceivedSample>)> {
        let mut state = self.state.lock().unwrap();

        let start = state.buf.len();
        state.buf.resize(start + self.config.receive_chunk_size, 0);
        let read_result = socket.try_read(&mut state.buf[start..]);
        let outcome = match read_result {
            Ok(0) => {
                state.buf.truncate(start);
                ReadOutcome::Eof
            }
            Ok(n) => {
                state.buf.truncate(start + n);
                trace!("received {} bytes", n);
                ReadOutcome::Data
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                state.buf.truncate(start);
                ReadOutcome::WouldBlock
            }
            Err(e) => {
                state.buf.truncate(start);
                return Err(e.into());
            }
        };

        let mut received = Vec::new();
        state.parse_packets(&self.config, &mut received)?;
        Ok((outcome, received))
    }

    /// Stops reading the previous socket (if any) and starts reading the connection's current
    ///  socket.
    pub fn rebind(self: &Arc<Self>, connection: &Arc<Connection>) {
        let Some((socket, epoch)) = connection.current_socket() else {
            debug!("connection has no socket, not starting to read");
            return;
        };

        let mut reader = self.reader.lock().unwrap();
        if let Some(previous) = reader.take() {
            previous.abort();
        }
        self.state.lock().unwrap().reset_for_rebind();

        let span = info_span!("reader", link_id = %self.link_id, epoch);
        *reader = Some(tokio::spawn(
            self.clone().read_loop(Arc::downgrade(connection), socket, epoch)
                .instrument(span)
        ));
    }

    pub fn stop(&self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }

    async fn read_loop(self: Arc<Self>, connection: Weak<Connection>, socket: Arc<dyn StreamSocket>, epoch: u64) {
        loop {
            let result = match socket.readable().await {
                Ok(()) => self.on_readable(socket.as_ref()),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok((outcome, received)) => {
                    if !received.is_empty() {
                        if let Some(link) = self.link.upgrade() {
                            for sample in received {
                                link.deliver(sample).await;
                            }
                        }
                    }

                    if outcome == ReadOutcome::Eof {
                        let Some(connection) = connection.upgrade() else { return; };
                        if self.gracefully_disconnected() {
                            connection.on_graceful_disconnect(epoch);
                        }
                        else {
                            debug!("peer closed the connection");
                            connection.request_reconnect(epoch);
                        }
                        return;
                    }
                }
                Err(e) => {
                    debug!("error receiving data: {}", e);
                    if let Some(connection) = connection.upgrade() {
                        connection.request_reconnect(epoch);
                    }
                    return;
                }
            }
        }
    }
}
