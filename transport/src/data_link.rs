use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::delivery::DeliveryReceipt;
use crate::link_key::LinkKey;
use crate::listener::TransportListener;
use crate::message_header::PublicationId;
use crate::receive_strategy::{ReceiveStrategy, ReceivedSample};
use crate::send_strategy::SendStrategy;
use crate::transport::Transport;

/// A channel to a peer: the unit applications send on. A link owns its send and receive
///  strategies and (once established) a [Connection], which it keeps across reconnects.
///
/// A link is shared by all associations between the same pair of nodes with the same priority,
///  and released when the last of them goes away.
pub struct DataLink {
    id: Uuid,
    key: LinkKey,
    listener: Arc<dyn TransportListener>,
    transport: Weak<Transport>,

    connection: Mutex<Option<Arc<Connection>>>,
    send_strategy: Arc<SendStrategy>,
    receive_strategy: Arc<ReceiveStrategy>,

    associations: AtomicUsize,
    released: AtomicBool,
}

impl DataLink {
    pub fn new(key: LinkKey, config: Arc<TransportConfig>, listener: Arc<dyn TransportListener>, transport: Weak<Transport>) -> Arc<DataLink> {
        Arc::new_cyclic(|link| {
            let id = Uuid::new_v4();
            debug!("creating link {} for {:?}", id, key);
            DataLink {
                id,
                key,
                listener,
                transport,
                connection: Mutex::new(None),
                send_strategy: SendStrategy::new(config.clone(), id),
                receive_strategy: ReceiveStrategy::new(config, link.clone(), id),
                associations: AtomicUsize::new(1),
                released: AtomicBool::new(false),
            }
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> LinkKey {
        self.key
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.key.remote_addr
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_connected())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn send_mode(&self) -> crate::send_strategy::SendMode {
        self.send_strategy.mode()
    }

    /// Binds the link's first connection and starts sending and receiving. A link is connected
    ///  only once, later connections go through [Self::reconnect].
    pub async fn connect(self: &Arc<Self>, connection: Arc<Connection>) -> anyhow::Result<()> {
        {
            let mut slot = self.connection.lock().unwrap();
            if self.is_released() {
                bail!("link {:?} was released", self.key);
            }
            if slot.is_some() {
                bail!("link {:?} is already connected", self.key);
            }
            *slot = Some(connection.clone());
        }

        connection.bind(self, &self.send_strategy, &self.receive_strategy);
        self.receive_strategy.rebind(&connection);
        self.send_strategy.rebind(&connection);
        self.send_strategy.start();

        info!("channel {:?} established", self.key);
        self.listener.on_channel_established(self.key.remote_addr).await;
        Ok(())
    }

    /// Replaces the link's (lost) accepting connection by a freshly accepted one. Queued data
    ///  survives and is sent on the new connection.
    pub async fn reconnect(self: &Arc<Self>, new_connection: Arc<Connection>) -> anyhow::Result<()> {
        if self.is_released() {
            bail!("link {:?} was released", self.key);
        }
        let old_connection = self.connection()
            .ok_or_else(|| anyhow!("link {:?} has no connection to replace", self.key))?;

        let notify_reconnected = new_connection.copy_state_from(&old_connection).await?;
        // the link may have been closed while waiting for the old connection's reconnect lock
        if self.is_released() {
            bail!("link {:?} was released while the new connection took over", self.key);
        }
        *self.connection.lock().unwrap() = Some(new_connection.clone());
        old_connection.shutdown();

        self.receive_strategy.rebind(&new_connection);
        self.send_strategy.restart();
        self.send_strategy.rebind(&new_connection);
        self.send_strategy.resume_send();

        if notify_reconnected {
            self.on_reconnected().await;
        }
        Ok(())
    }

    pub fn send(&self, publication_id: PublicationId, payload: Bytes) -> DeliveryReceipt {
        self.send_strategy.send(publication_id, payload, true)
    }

    pub fn send_batch(&self, samples: Vec<(PublicationId, Bytes)>) -> Vec<DeliveryReceipt> {
        self.send_strategy.send_batch(samples)
    }

    pub fn remove_publication(&self, publication_id: PublicationId) {
        self.send_strategy.remove_publication(publication_id);
    }

    pub fn add_association(&self) {
        self.associations.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` if this was the link's last association
    pub fn release_association(&self) -> bool {
        self.associations.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Closes the link after telling the peer, so the peer does not try to restore the
    ///  connection. Idempotent.
    pub fn release(&self) {
        self.close(true);
    }

    /// Closes the link without telling the peer. Idempotent.
    pub fn tear_down(&self) {
        self.close(false);
    }

    fn close(&self, graceful: bool) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing link {:?} (graceful: {})", self.key, graceful);

        if graceful && self.is_connected() {
            self.send_strategy.send_graceful_disconnect();
        }
        self.send_strategy.terminate_send();
        self.send_strategy.stop();
        self.receive_strategy.stop();

        if let Some(connection) = self.connection() {
            connection.shutdown();
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_link(&self.key, self.id);
        }
    }

    pub(crate) async fn deliver(&self, sample: ReceivedSample) {
        self.listener.on_bytes_received(sample.payload, sample.publication_id, self.key.remote_addr).await;
    }

    pub(crate) async fn on_disconnected(&self) {
        info!("channel {:?} disconnected", self.key);
        self.listener.on_channel_disconnected(self.key.remote_addr).await;
    }

    pub(crate) async fn on_reconnected(&self) {
        info!("channel {:?} reconnected", self.key);
        self.listener.on_channel_reconnected(self.key.remote_addr).await;
    }

    pub(crate) async fn on_lost(&self) {
        info!("channel {:?} lost", self.key);
        self.listener.on_channel_lost(self.key.remote_addr).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use tokio::sync::Notify;
    use crate::connector::MockStreamConnector;
    use crate::delivery::DeliveryOutcome;
    use crate::handshake::HandshakeMsg;
    use crate::listener::MockTransportListener;
    use crate::send_strategy::SendMode;
    use crate::stream_socket::StreamSocket;
    use crate::test_util::{decode_packets, ChannelEvent, FakeSocket, RecordingListener};

    fn remote_addr() -> SocketAddr {
        SocketAddr::from(([10,0,0,2], 7000))
    }

    fn config() -> Arc<TransportConfig> {
        Arc::new(TransportConfig::new(SocketAddr::from(([10,0,0,1], 7000))))
    }

    fn connection_for(key: LinkKey, socket: &Arc<FakeSocket>) -> Arc<Connection> {
        let mut connector = MockStreamConnector::new();
        let s = socket.clone();
        connector.expect_connect()
            .returning(move |_| Ok(s.clone() as Arc<dyn StreamSocket>));
        Connection::new(key, SocketAddr::from(([10,0,0,1], 7000)), config(), Arc::new(connector))
    }

    /// an accepting connection on a socket that delivered the peer's handshake
    async fn accepted(socket: &Arc<FakeSocket>) -> Arc<Connection> {
        let mut handshake = BytesMut::new();
        HandshakeMsg { self_addr: remote_addr(), priority: 0 }.ser(&mut handshake);
        socket.push_incoming(&handshake);
        Connection::passive_open(socket.clone(), config(), Arc::new(MockStreamConnector::new()), SocketAddr::from(([10,0,0,1], 7000))).await.unwrap()
    }

    /// Records like [RecordingListener], but holds up the loss notification until released
    struct LossGatingListener {
        recording: Arc<RecordingListener>,
        lost_gate: Notify,
    }

    #[async_trait]
    impl TransportListener for LossGatingListener {
        async fn on_bytes_received(&self, payload: Bytes, publication_id: PublicationId, source_addr: SocketAddr) {
            self.recording.on_bytes_received(payload, publication_id, source_addr).await;
        }

        async fn on_channel_established(&self, remote_addr: SocketAddr) {
            self.recording.on_channel_established(remote_addr).await;
        }

        async fn on_channel_disconnected(&self, remote_addr: SocketAddr) {
            self.recording.on_channel_disconnected(remote_addr).await;
        }

        async fn on_channel_reconnected(&self, remote_addr: SocketAddr) {
            self.recording.on_channel_reconnected(remote_addr).await;
        }

        async fn on_channel_lost(&self, remote_addr: SocketAddr) {
            self.recording.on_channel_lost(remote_addr).await;
            self.lost_gate.notified().await;
        }
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let key = LinkKey::new(remote_addr(), 0, true);
        let listener = RecordingListener::new();
        let link = DataLink::new(key, config(), listener.clone(), Weak::new());

        let socket = FakeSocket::new();
        let connection = connection_for(key, &socket);
        connection.active_establish().await.unwrap();
        link.connect(connection.clone()).await.unwrap();
        assert!(link.is_connected());
        assert_eq!(listener.events(), vec![ChannelEvent::Established(remote_addr())]);

        let other = connection_for(key, &FakeSocket::new());
        assert!(link.connect(other).await.is_err());
        assert!(Arc::ptr_eq(&link.connection().unwrap(), &connection));
        assert_eq!(listener.events().len(), 1);
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let key = LinkKey::new(remote_addr(), 0, true);
        let listener = RecordingListener::new();
        let link = DataLink::new(key, config(), listener.clone(), Weak::new());

        let socket = FakeSocket::new();
        let connection = connection_for(key, &socket);
        connection.active_establish().await.unwrap();

        // sent before the link is connected: queued until it is
        let early = link.send(PublicationId(1), Bytes::from_static(b"early"));
        link.connect(connection).await.unwrap();
        let late = link.send(PublicationId(1), Bytes::from_static(b"late"));

        assert_eq!(early.outcome().await, DeliveryOutcome::Delivered);
        assert_eq!(late.outcome().await, DeliveryOutcome::Delivered);

        // the handshake precedes the packets
        let written = socket.written();
        let payloads = decode_packets(&written[24..]).into_iter()
            .flat_map(|(_, messages)| messages)
            .map(|(_, payload)| payload)
            .collect::<Vec<_>>();
        assert_eq!(payloads, vec![Bytes::from_static(b"early"), Bytes::from_static(b"late")]);

        // loop the written packets back to the link's own receive side
        socket.push_incoming(&written[24..]);
        assert!(listener.wait_until(Duration::from_secs(5), |l| l.samples().len() == 2).await);
        assert_eq!(listener.samples(), vec![
            (PublicationId(1), Bytes::from_static(b"early"), remote_addr()),
            (PublicationId(1), Bytes::from_static(b"late"), remote_addr()),
        ]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let key = LinkKey::new(remote_addr(), 0, true);
        let mut listener = MockTransportListener::new();
        listener.expect_on_channel_established().times(1).return_const(());
        let link = DataLink::new(key, config(), Arc::new(listener), Weak::new());

        let socket = FakeSocket::new();
        let connection = connection_for(key, &socket);
        connection.active_establish().await.unwrap();
        link.connect(connection.clone()).await.unwrap();
        let handshake_len = socket.written().len();

        link.release();
        link.release();
        link.tear_down();

        assert!(link.is_released());
        assert!(connection.is_shut_down());
        assert!(socket.is_closed());

        let messages = decode_packets(&socket.written()[handshake_len..]).into_iter()
            .flat_map(|(_, messages)| messages)
            .collect::<Vec<_>>();
        assert_eq!(messages.len(), 1);

        let mut receipt = link.send(PublicationId(1), Bytes::from_static(b"too late"));
        assert_eq!(receipt.try_outcome(), Some(DeliveryOutcome::Dropped));
        assert!(link.connect(connection_for(key, &FakeSocket::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_samples_queued_while_waiting_for_peer_survive_takeover() {
        let key = LinkKey::new(remote_addr(), 0, false);
        let listener = RecordingListener::new();
        let link = DataLink::new(key, config(), listener.clone(), Weak::new());

        let old_socket = FakeSocket::new();
        link.connect(accepted(&old_socket).await).await.unwrap();

        old_socket.close_from_peer();
        assert!(listener.wait_until(Duration::from_secs(5), |l| l.events().contains(&ChannelEvent::Disconnected(remote_addr()))).await);
        assert_eq!(link.send_mode(), SendMode::Suspend);

        let expected = (0..5u64)
            .map(|i| (PublicationId(i), Bytes::from(format!("sample {}", i))))
            .collect::<Vec<_>>();
        let mut receipts = expected.iter()
            .map(|(publication_id, payload)| link.send(*publication_id, payload.clone()))
            .collect::<Vec<_>>();
        for receipt in receipts.iter_mut() {
            assert_eq!(receipt.try_outcome(), None);
        }
        assert!(old_socket.written().is_empty());

        let new_socket = FakeSocket::new();
        link.reconnect(accepted(&new_socket).await).await.unwrap();

        for receipt in receipts {
            assert_eq!(receipt.outcome().await, DeliveryOutcome::Delivered);
        }
        let written = decode_packets(&new_socket.written()).into_iter()
            .flat_map(|(_, messages)| messages)
            .map(|(header, payload)| (header.publication_id, payload))
            .collect::<Vec<_>>();
        assert_eq!(written, expected);
        assert_eq!(listener.events(), vec![
            ChannelEvent::Established(remote_addr()),
            ChannelEvent::Disconnected(remote_addr()),
            ChannelEvent::Reconnected(remote_addr()),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_takeover_once_loss_is_reported() {
        let key = LinkKey::new(remote_addr(), 0, false);
        let recording = RecordingListener::new();
        let listener = Arc::new(LossGatingListener { recording: recording.clone(), lost_gate: Notify::new() });
        let link = DataLink::new(key, config(), listener.clone(), Weak::new());

        let old_socket = FakeSocket::new();
        link.connect(accepted(&old_socket).await).await.unwrap();

        // the peer does not come back in time, and the loss notification is still in progress
        old_socket.close_from_peer();
        assert!(recording.wait_until(Duration::from_secs(60), |l| l.count_events(|e| matches!(e, ChannelEvent::Lost(_))) == 1).await);
        assert!(!link.is_released());

        let new_socket = FakeSocket::new();
        let replacement = accepted(&new_socket).await;
        let l = link.clone();
        let takeover = tokio::spawn(async move {
            l.reconnect(replacement).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        listener.lost_gate.notify_one();

        assert!(takeover.await.unwrap().is_err());
        assert!(link.is_released());
        assert_eq!(link.send_mode(), SendMode::Terminated);
        assert!(new_socket.written().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(recording.events(), vec![
            ChannelEvent::Established(remote_addr()),
            ChannelEvent::Disconnected(remote_addr()),
            ChannelEvent::Lost(remote_addr()),
        ]);
    }

    #[test]
    fn test_associations() {
        let link = DataLink::new(LinkKey::new(remote_addr(), 0, true), config(), RecordingListener::new(), Weak::new());
        link.add_association();
        assert!(!link.release_association());
        assert!(link.release_association());
    }
}
