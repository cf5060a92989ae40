use std::collections::VecDeque;
use std::future::pending;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, Weak};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info_span, trace, warn, Instrument};
use uuid::Uuid;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::delivery::{fragment, DeliveryOutcome, DeliveryReceipt, QueueElement};
use crate::message_header::{MessageFlags, MessageHeader, MessageKind, PublicationId};
use crate::packet_header::PacketHeader;
use crate::safe_converter::PrecheckedCast;
use crate::stream_socket::StreamSocket;

/// The send strategy's modes:
///
/// ```ascii
/// NotSet --start--> Direct <--would block / drained--> Queue
///                      ^                                 ^
///                      +------ suspend / resume ---------+--> Suspend
///
/// any mode --terminate--> Terminated
/// ```
///
/// * `Direct`: samples are written to the socket as soon as a packet is complete or flushed
/// * `Queue`: the socket did not accept all data, so samples are queued and a background worker
///   drains them as the socket becomes writable
/// * `Suspend`: the connection is down, samples are queued until it is re-established
/// * `Terminated`: everything (including later sends) is dropped
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendMode {
    NotSet,
    Direct,
    Queue,
    Suspend,
    Terminated,
}

struct PacketBuilder {
    buf: BytesMut,
    elements: Vec<QueueElement>,
}

impl PacketBuilder {
    fn new(config: &TransportConfig) -> PacketBuilder {
        let mut buf = BytesMut::with_capacity(config.optimum_packet_size);
        // placeholder, the header is patched when the packet is finalized
        buf.put_bytes(0, PacketHeader::SERIALIZED_LEN);
        PacketBuilder {
            buf,
            elements: Vec::new(),
        }
    }

    fn message_count(&self) -> usize {
        self.elements.len()
    }

    /// An empty packet accepts any single message: messages are never bigger than
    ///  `max_message_size`, and that fits into `max_packet_size`
    fn fits(&self, element: &QueueElement, config: &TransportConfig) -> bool {
        if self.elements.is_empty() {
            return true;
        }
        self.message_count() < config.max_samples_per_packet
            && self.buf.len() + MessageHeader::SERIALIZED_LEN + element.payload.len() <= config.optimum_packet_size
    }

    fn is_full(&self, config: &TransportConfig) -> bool {
        self.message_count() >= config.max_samples_per_packet
            || self.buf.len() >= config.optimum_packet_size
    }

    fn push(&mut self, element: QueueElement) {
        MessageHeader {
            kind: element.kind,
            flags: element.flags,
            publication_id: element.publication_id,
            payload_len: element.payload.len().prechecked_cast(),
        }.ser(&mut self.buf);
        self.buf.put_slice(&element.payload);
        self.elements.push(element);
    }

    fn finalize(mut self, sequence_number: u64) -> PacketInFlight {
        PacketHeader {
            message_count: self.message_count().prechecked_cast(),
            body_len: (self.buf.len() - PacketHeader::SERIALIZED_LEN).prechecked_cast(),
            sequence_number,
        }.patch_into(&mut self.buf);

        PacketInFlight {
            bytes: self.buf.freeze(),
            written: 0,
            elements: self.elements,
        }
    }
}

/// A finalized packet that was not (yet) completely written to the socket
struct PacketInFlight {
    bytes: Bytes,
    written: usize,
    elements: Vec<QueueElement>,
}

enum WriteOutcome {
    Complete,
    Blocked,
    Failed,
}

enum WorkStep {
    AwaitWritable(Arc<dyn StreamSocket>),
    Idle,
}

/// Things to do after the lock on the inner state is released
#[derive(Default)]
struct Effects {
    resolved: Vec<(QueueElement, DeliveryOutcome)>,
    reconnect: Option<(Weak<Connection>, u64)>,
    wake_worker: bool,
}

struct SendInner {
    mode: SendMode,
    mode_before_suspend: SendMode,

    connection: Weak<Connection>,
    socket: Option<Arc<dyn StreamSocket>>,
    socket_epoch: u64,

    /// Data goes to the wire in this order: `in_flight`, then `current`, then `queue`
    in_flight: Option<PacketInFlight>,
    current: Option<PacketBuilder>,
    queue: VecDeque<QueueElement>,

    next_sequence_number: u64,
    paused_since: Option<Instant>,
}

impl SendInner {
    fn has_pending_data(&self) -> bool {
        self.in_flight.is_some()
            || self.current.as_ref().is_some_and(|c| c.message_count() > 0)
            || !self.queue.is_empty()
    }

    fn finalize(&mut self, packet: PacketBuilder) -> PacketInFlight {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        packet.finalize(sequence_number)
    }

    fn enter_queue_mode(&mut self, effects: &mut Effects) {
        self.mode = SendMode::Queue;
        self.paused_since.get_or_insert_with(Instant::now);
        effects.wake_worker = true;
    }

    fn suspend(&mut self, effects: &mut Effects) {
        match self.mode {
            SendMode::NotSet | SendMode::Direct | SendMode::Queue => {
                trace!("suspending send in mode {:?}", self.mode);
                self.mode_before_suspend = self.mode;
                self.mode = SendMode::Suspend;
                self.paused_since.get_or_insert_with(Instant::now);
                // the worker arms the backpressure timer
                effects.wake_worker = true;
            }
            SendMode::Suspend | SendMode::Terminated => {}
        }
    }

    fn write_in_flight(&mut self, effects: &mut Effects) -> WriteOutcome {
        let Some(packet) = self.in_flight.as_mut() else {
            return WriteOutcome::Complete;
        };
        let Some(socket) = self.socket.as_ref() else {
            return WriteOutcome::Blocked;
        };

        let mut failure = None;
        while packet.written < packet.bytes.len() {
            match socket.try_write(&packet.bytes[packet.written..]) {
                Ok(0) => {
                    failure = Some(ErrorKind::WriteZero.into());
                    break;
                }
                Ok(n) => packet.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return WriteOutcome::Blocked,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            debug!("error writing to socket, requesting reconnect: {}", e);
            self.suspend(effects);
            effects.reconnect = Some((self.connection.clone(), self.socket_epoch));
            return WriteOutcome::Failed;
        }

        if let Some(packet) = self.in_flight.take() {
            trace!("wrote packet of {} bytes with {} messages", packet.bytes.len(), packet.elements.len());
            for element in packet.elements {
                effects.resolved.push((element, DeliveryOutcome::Delivered));
            }
        }
        WriteOutcome::Complete
    }

    fn write_current_direct(&mut self, effects: &mut Effects) {
        let Some(current) = self.current.take() else {
            return;
        };
        if current.message_count() == 0 {
            return;
        }

        let packet = self.finalize(current);
        self.in_flight = Some(packet);
        match self.write_in_flight(effects) {
            WriteOutcome::Complete | WriteOutcome::Failed => {}
            WriteOutcome::Blocked => {
                trace!("socket would block, switching to queue mode");
                self.enter_queue_mode(effects);
            }
        }
    }

    fn push_direct(&mut self, element: QueueElement, config: &TransportConfig, effects: &mut Effects) {
        if self.current.as_ref().is_some_and(|c| !c.fits(&element, config)) {
            self.write_current_direct(effects);
        }
        if self.mode != SendMode::Direct {
            self.queue.push_back(element);
            return;
        }

        let current = self.current.get_or_insert_with(|| PacketBuilder::new(config));
        current.push(element);
        if current.is_full(config) {
            self.write_current_direct(effects);
        }
    }

    fn push(&mut self, element: QueueElement, config: &TransportConfig, effects: &mut Effects) {
        match self.mode {
            SendMode::Direct => self.push_direct(element, config, effects),
            SendMode::NotSet | SendMode::Queue | SendMode::Suspend => self.queue.push_back(element),
            SendMode::Terminated => effects.resolved.push((element, DeliveryOutcome::Dropped)),
        }
    }

    fn flush(&mut self, effects: &mut Effects) {
        match self.mode {
            SendMode::Direct => self.write_current_direct(effects),
            SendMode::Queue => effects.wake_worker = true,
            SendMode::NotSet | SendMode::Suspend | SendMode::Terminated => {}
        }
    }

    /// Writes as much queued data as the socket accepts, returning to `Direct` mode when
    ///  everything is written
    fn drain(&mut self, config: &TransportConfig, effects: &mut Effects) -> WorkStep {
        loop {
            if self.mode != SendMode::Queue {
                return WorkStep::Idle;
            }

            if self.in_flight.is_some() {
                match self.write_in_flight(effects) {
                    WriteOutcome::Complete => continue,
                    WriteOutcome::Failed => return WorkStep::Idle,
                    WriteOutcome::Blocked => return match &self.socket {
                        Some(socket) => WorkStep::AwaitWritable(socket.clone()),
                        None => WorkStep::Idle,
                    },
                }
            }

            if let Some(current) = self.current.take() {
                if current.message_count() > 0 {
                    let packet = self.finalize(current);
                    self.in_flight = Some(packet);
                }
                continue;
            }

            if !self.queue.is_empty() {
                let mut packet = PacketBuilder::new(config);
                loop {
                    match self.queue.front() {
                        Some(e) if packet.fits(e, config) => {}
                        _ => break,
                    }
                    if let Some(e) = self.queue.pop_front() {
                        packet.push(e);
                    }
                    if packet.is_full(config) {
                        break;
                    }
                }
                let packet = self.finalize(packet);
                self.in_flight = Some(packet);
                continue;
            }

            trace!("queue drained, switching to direct mode");
            self.mode = SendMode::Direct;
            self.paused_since = None;
            return WorkStep::Idle;
        }
    }

    fn drop_all(&mut self, effects: &mut Effects) {
        if let Some(packet) = self.in_flight.take() {
            for e in packet.elements {
                effects.resolved.push((e, DeliveryOutcome::Dropped));
            }
        }
        if let Some(current) = self.current.take() {
            for e in current.elements {
                effects.resolved.push((e, DeliveryOutcome::Dropped));
            }
        }
        for e in self.queue.drain(..) {
            effects.resolved.push((e, DeliveryOutcome::Dropped));
        }
    }
}

/// Turns samples into packets on a connection's socket. See [SendMode] for the state machine.
///
/// Sending never waits: if the socket does not accept data, it is queued and written by a
///  background worker. Every sample gets exactly one [DeliveryOutcome], and samples reach the
///  wire (or are dropped) in the order they were sent.
pub struct SendStrategy {
    config: Arc<TransportConfig>,
    link_id: Uuid,
    inner: Mutex<SendInner>,
    work_available: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SendStrategy {
    pub fn new(config: Arc<TransportConfig>, link_id: Uuid) -> Arc<SendStrategy> {
        Arc::new(SendStrategy {
            config,
            link_id,
            inner: Mutex::new(SendInner {
                mode: SendMode::NotSet,
                mode_before_suspend: SendMode::NotSet,
                connection: Weak::new(),
                socket: None,
                socket_epoch: 0,
                in_flight: None,
                current: None,
                queue: VecDeque::new(),
                next_sequence_number: 0,
                paused_since: None,
            }),
            work_available: Notify::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> SendMode {
        self.inner.lock().unwrap().mode
    }

    fn apply(&self, effects: Effects) {
        for (element, outcome) in effects.resolved {
            element.resolve(outcome);
        }
        if let Some((connection, epoch)) = effects.reconnect {
            if let Some(connection) = connection.upgrade() {
                connection.request_reconnect(epoch);
            }
        }
        if effects.wake_worker {
            self.work_available.notify_one();
        }
    }

    /// Moves from `NotSet` to normal operation, starting the background worker
    pub fn start(self: &Arc<Self>) {
        {
            let mut worker = self.worker.lock().unwrap();
            if worker.is_none() {
                let span = info_span!("send_worker", link_id = %self.link_id);
                *worker = Some(tokio::spawn(self.clone().worker_loop().instrument(span)));
            }
        }

        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode == SendMode::NotSet {
                if inner.has_pending_data() {
                    inner.enter_queue_mode(&mut effects);
                }
                else {
                    inner.mode = SendMode::Direct;
                }
            }
        }
        self.apply(effects);
    }

    /// Aborts the background worker. This does not touch queued data, see [Self::terminate_send].
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }

    /// Binds the strategy to a connection's current socket. A packet that was partially written
    ///  to a previous socket is sent again from its first byte, since the receiving side
    ///  discards incomplete packets when its connection is replaced.
    pub fn rebind(&self, connection: &Arc<Connection>) {
        self.bind(Arc::downgrade(connection), connection.current_socket());
    }

    pub(crate) fn bind(&self, connection: Weak<Connection>, socket: Option<(Arc<dyn StreamSocket>, u64)>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.connection = connection;
            match socket {
                Some((socket, epoch)) => {
                    inner.socket = Some(socket);
                    inner.socket_epoch = epoch;
                }
                None => inner.socket = None,
            }
            if let Some(packet) = inner.in_flight.as_mut() {
                packet.written = 0;
            }
        }
        self.work_available.notify_one();
    }

    /// Sends a single sample and flushes it. Samples bigger than `max_message_size` are
    ///  fragmented.
    pub fn send(&self, publication_id: PublicationId, payload: Bytes, flush: bool) -> DeliveryReceipt {
        let (elements, receipt) = fragment(publication_id, payload, self.config.max_message_size);
        self.enqueue(elements, flush);
        receipt
    }

    /// Sends several samples, packing them into as few packets as possible and flushing once
    ///  after the last one
    pub fn send_batch(&self, samples: Vec<(PublicationId, Bytes)>) -> Vec<DeliveryReceipt> {
        let mut receipts = Vec::with_capacity(samples.len());
        let mut elements = Vec::new();
        for (publication_id, payload) in samples {
            let (fragments, receipt) = fragment(publication_id, payload, self.config.max_message_size);
            elements.extend(fragments);
            receipts.push(receipt);
        }
        self.enqueue(elements, true);
        receipts
    }

    /// Best effort: writes a graceful disconnect message if the socket accepts it right away
    pub fn send_graceful_disconnect(&self) {
        let element = QueueElement {
            kind: MessageKind::GracefulDisconnect,
            flags: MessageFlags::empty(),
            publication_id: PublicationId(0),
            payload: Bytes::new(),
            tracker: None,
        };
        self.enqueue(vec![element], true);
    }

    fn enqueue(&self, elements: Vec<QueueElement>, flush: bool) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().unwrap();
            for element in elements {
                inner.push(element, &self.config, &mut effects);
            }
            if flush {
                inner.flush(&mut effects);
            }
        }
        self.apply(effects);
    }

    pub fn flush(&self) {
        self.enqueue(Vec::new(), true);
    }

    pub fn suspend_send(&self) {
        let mut effects = Effects::default();
        self.inner.lock().unwrap().suspend(&mut effects);
        self.apply(effects);
    }

    /// Returns from `Suspend` to the mode before suspension, or to `Queue` if there is data
    ///  waiting to be written
    pub fn resume_send(&self) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode != SendMode::Suspend {
                return;
            }

            if inner.mode_before_suspend == SendMode::NotSet {
                inner.mode = SendMode::NotSet;
            }
            else if inner.has_pending_data() {
                inner.paused_since = None;
                inner.enter_queue_mode(&mut effects);
            }
            else {
                inner.mode = SendMode::Direct;
                inner.paused_since = None;
            }
            trace!("resumed send in mode {:?}", inner.mode);
        }
        self.apply(effects);
    }

    /// Drops everything that is queued or partially written, and all later sends
    pub fn terminate_send(&self) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.mode != SendMode::Terminated {
                debug!("terminating send");
            }
            inner.mode = SendMode::Terminated;
            inner.paused_since = None;
            inner.drop_all(&mut effects);
        }
        self.apply(effects);
    }

    /// Makes a terminated strategy usable again after its connection was re-established
    pub fn restart(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode == SendMode::Terminated {
            debug!("restarting send");
            inner.mode = SendMode::Direct;
        }
    }

    /// Drops the queued samples of a publication that goes away. Data that is already part of
    ///  a packet is still sent.
    pub fn remove_publication(&self, publication_id: PublicationId) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().unwrap();
            let (removed, retained): (VecDeque<_>, VecDeque<_>) = inner.queue.drain(..)
                .partition(|e| e.publication_id == publication_id);
            inner.queue = retained;
            for e in removed {
                effects.resolved.push((e, DeliveryOutcome::Dropped));
            }
        }
        self.apply(effects);
    }

    fn perform_work(&self) -> WorkStep {
        let mut effects = Effects::default();
        let step = self.inner.lock().unwrap()
            .drain(&self.config, &mut effects);
        self.apply(effects);
        step
    }

    fn pause_deadline(&self) -> Option<Instant> {
        let max_pause = self.config.max_output_pause_period?;
        let inner = self.inner.lock().unwrap();
        match inner.mode {
            SendMode::Queue | SendMode::Suspend => inner.paused_since.map(|since| since + max_pause),
            _ => None,
        }
    }

    fn on_pause_timeout(&self) {
        let connection = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.mode, SendMode::Queue | SendMode::Suspend) {
                return;
            }
            // start a new pause window to avoid reporting the same timeout in a loop
            inner.paused_since = Some(Instant::now());
            inner.connection.clone()
        };

        warn!("output paused for longer than {:?}", self.config.max_output_pause_period);
        if let Some(connection) = connection.upgrade() {
            connection.notify_lost_on_backpressure_timeout();
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let step = self.perform_work();
            let pause_deadline = self.pause_deadline();

            let writable = async {
                match &step {
                    WorkStep::AwaitWritable(socket) => {
                        // errors show up on the next write
                        let _ = socket.writable().await;
                    }
                    WorkStep::Idle => pending().await,
                }
            };
            let pause_timeout = async {
                match pause_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                _ = writable => {}
                _ = self.work_available.notified() => {}
                _ = pause_timeout => self.on_pause_timeout(),
            }
        }
    }
}
