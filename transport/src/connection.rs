use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use anyhow::{anyhow, bail};
use bytes::BytesMut;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;
use crate::backoff::RetryBackoff;
use crate::config::TransportConfig;
use crate::connector::StreamConnector;
use crate::data_link::DataLink;
use crate::handshake::HandshakeMsg;
use crate::link_key::LinkKey;
use crate::receive_strategy::ReceiveStrategy;
use crate::reconnect_state::{ConnectionRole, ReconnectAction, ReconnectEvent, ReconnectMachine};
use crate::send_strategy::SendStrategy;
use crate::stream_socket::{read_exact, write_fully, StreamSocket};

struct ReconnectControl {
    machine: ReconnectMachine,
    passive_timer: Option<JoinHandle<()>>,
    /// Set when a freshly accepted connection took over, suppressing a concurrently firing
    ///  passive timer
    replaced_by: Weak<Connection>,
}

#[derive(Clone, Default)]
struct Bindings {
    link: Weak<DataLink>,
    send_strategy: Weak<SendStrategy>,
    receive_strategy: Weak<ReceiveStrategy>,
}

/// A TCP connection to a peer, owned by the [DataLink] it serves. The connection outlives its
///  sockets: after a loss, the initiating side reconnects with exponential backoff and the
///  accepting side waits for the peer to reconnect, and either way the connection (with its
///  link and queued data) stays the same.
///
/// All reconnect decisions are made by a [ReconnectMachine] under the connection's reconnect
///  lock, which is held for a whole reconnect cycle. Failure reports carry the 'epoch' of the
///  socket they refer to, so reports about a socket that was already replaced are ignored.
pub struct Connection {
    id: Uuid,
    role: ConnectionRole,
    key: LinkKey,
    /// The address announced to the peer in the handshake
    local_addr: SocketAddr,
    config: Arc<TransportConfig>,
    connector: Arc<dyn StreamConnector>,

    socket: Mutex<Option<(Arc<dyn StreamSocket>, u64)>>,
    last_epoch: AtomicU64,

    is_shut_down: AtomicBool,
    /// Set when sending stayed paused for too long while a reconnect cycle was running: the
    ///  cycle stops retrying and declares the loss
    backpressure_expired: AtomicBool,
    /// Wakes a reconnect cycle's backoff sleep on shutdown or backpressure timeout
    interrupt_notify: Notify,

    reconnect: Arc<AsyncMutex<ReconnectControl>>,
    bindings: Mutex<Bindings>,
}

impl Connection {
    pub fn new(key: LinkKey, local_addr: SocketAddr, config: Arc<TransportConfig>, connector: Arc<dyn StreamConnector>) -> Arc<Connection> {
        let role = if key.is_active {
            ConnectionRole::Initiator
        }
        else {
            ConnectionRole::Acceptor
        };

        Arc::new(Connection {
            id: Uuid::new_v4(),
            role,
            key,
            local_addr,
            config,
            connector,
            socket: Mutex::new(None),
            last_epoch: AtomicU64::new(0),
            is_shut_down: AtomicBool::new(false),
            backpressure_expired: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
            reconnect: Arc::new(AsyncMutex::new(ReconnectControl {
                machine: ReconnectMachine::default(),
                passive_timer: None,
                replaced_by: Weak::new(),
            })),
            bindings: Default::default(),
        })
    }

    /// Reads the handshake from a freshly accepted stream, returning an accepting connection
    ///  keyed by the address the peer announced
    pub async fn passive_open(socket: Arc<dyn StreamSocket>, config: Arc<TransportConfig>, connector: Arc<dyn StreamConnector>, local_addr: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        let mut buf = [0u8; HandshakeMsg::SERIALIZED_LEN];
        timeout(config.handshake_timeout, read_exact(socket.as_ref(), &mut buf)).await
            .map_err(|_| anyhow!("timeout waiting for handshake"))??;
        let handshake = HandshakeMsg::deser(&mut buf.as_slice())?;

        let key = LinkKey::new(handshake.self_addr, handshake.priority, false);
        debug!("accepted connection {:?}", key);

        let connection = Connection::new(key, local_addr, config, connector);
        connection.install_socket(socket);
        Ok(connection)
    }

    /// Connects to the peer and sends the handshake
    pub async fn active_establish(&self) -> anyhow::Result<()> {
        let socket = self.connector.connect(self.key.remote_addr).await?;

        let mut buf = BytesMut::with_capacity(HandshakeMsg::SERIALIZED_LEN);
        HandshakeMsg {
            self_addr: self.local_addr,
            priority: self.key.priority,
        }.ser(&mut buf);

        let handshake_result = timeout(self.config.connect_timeout, write_fully(socket.as_ref(), &buf)).await;
        match handshake_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                socket.close();
                return Err(e.into());
            }
            Err(_) => {
                socket.close();
                bail!("timeout sending handshake to {:?}", self.key.remote_addr);
            }
        }

        if self.is_shut_down() {
            socket.close();
            bail!("connection {:?} was shut down while connecting", self.key);
        }

        trace!("established connection {:?}", self.key);
        self.install_socket(socket);
        Ok(())
    }

    fn install_socket(&self, socket: Arc<dyn StreamSocket>) -> u64 {
        let epoch = self.last_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let previous = self.socket.lock().unwrap()
            .replace((socket, epoch));
        if let Some((previous, _)) = previous {
            previous.close();
        }
        epoch
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> LinkKey {
        self.key
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.socket.lock().unwrap().is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }

    pub fn current_socket(&self) -> Option<(Arc<dyn StreamSocket>, u64)> {
        self.socket.lock().unwrap().clone()
    }

    fn is_current_epoch(&self, epoch: u64) -> bool {
        matches!(self.socket.lock().unwrap().as_ref(), Some((_, e)) if *e == epoch)
    }

    pub(crate) fn bind(&self, link: &Arc<DataLink>, send_strategy: &Arc<SendStrategy>, receive_strategy: &Arc<ReceiveStrategy>) {
        *self.bindings.lock().unwrap() = Bindings {
            link: Arc::downgrade(link),
            send_strategy: Arc::downgrade(send_strategy),
            receive_strategy: Arc::downgrade(receive_strategy),
        };
    }

    fn bindings(&self) -> Bindings {
        self.bindings.lock().unwrap().clone()
    }

    /// Closes the current socket, if any
    pub fn disconnect(&self) {
        if let Some((socket, epoch)) = self.socket.lock().unwrap().take() {
            trace!("closing socket of {:?} (epoch {})", self.key, epoch);
            socket.close();
        }
    }

    fn suspend_sending(&self) {
        if let Some(send_strategy) = self.bindings().send_strategy.upgrade() {
            send_strategy.suspend_send();
        }
    }

    fn span(&self) -> tracing::Span {
        info_span!("connection", conn_id = %self.id, key = ?self.key)
    }

    /// Called by the strategies when reading or writing the socket of the given epoch failed.
    ///  Sending is suspended right away, and the reconnect cycle runs in the background.
    pub(crate) fn request_reconnect(self: &Arc<Self>, epoch: u64) {
        if self.is_shut_down() || !self.is_current_epoch(epoch) {
            trace!("ignoring failure report for stale socket epoch {}", epoch);
            return;
        }

        self.suspend_sending();
        let span = self.span();
        tokio::spawn(self.clone().reconnect_after_failure(epoch).instrument(span));
    }

    async fn reconnect_after_failure(self: Arc<Self>, epoch: u64) {
        let control = self.reconnect.clone().lock_owned().await;
        // a concurrent report for the same socket may have completed a whole cycle meanwhile
        if !self.is_current_epoch(epoch) {
            trace!("socket epoch {} was already handled", epoch);
            return;
        }
        self.handle_loss(control).await;
    }

    /// `on_new_association` is for an initiator whose link was lost and that gets a new
    ///  association: this makes a single attempt to connect. Otherwise the current socket is
    ///  treated as failed.
    pub async fn reconnect(self: &Arc<Self>, on_new_association: bool) {
        let mut control = self.reconnect.clone().lock_owned().await;
        if on_new_association {
            if control.machine.on_event(ReconnectEvent::NewAssociation) == ReconnectAction::RetryActive {
                self.active_reconnect(control, true).await;
            }
        }
        else {
            self.handle_loss(control).await;
        }
    }

    async fn handle_loss(self: &Arc<Self>, mut control: OwnedMutexGuard<ReconnectControl>) {
        let action = control.machine.on_event(ReconnectEvent::LossDetected {
            role: self.role,
            passive_reconnect_enabled: self.config.is_passive_reconnect_enabled(),
        });

        match action {
            ReconnectAction::RetryActive => self.active_reconnect(control, false).await,
            ReconnectAction::AwaitPassive => self.await_passive(control).await,
            ReconnectAction::DeclareLost => {
                self.suspend_sending();
                self.disconnect();
                self.declare_lost().await;
            }
            _ => {}
        }
    }

    async fn active_reconnect(self: &Arc<Self>, mut control: OwnedMutexGuard<ReconnectControl>, on_new_association: bool) {
        let bindings = self.bindings();
        self.suspend_sending();
        self.disconnect();
        self.backpressure_expired.store(false, Ordering::Release);

        let backoff = if on_new_association {
            RetryBackoff::new(Duration::ZERO, 1.0, 1)
        }
        else {
            RetryBackoff::from_config(&self.config)
        };

        if !on_new_association && self.config.conn_retry_attempts > 0 {
            if let Some(link) = bindings.link.upgrade() {
                link.on_disconnected().await;
            }
        }

        let mut established = false;
        for (attempt, delay) in backoff.enumerate() {
            if self.is_shut_down() {
                return;
            }
            if self.is_backpressure_expired() {
                break;
            }
            match self.active_establish().await {
                Ok(()) => {
                    established = true;
                    break;
                }
                Err(e) => debug!("reconnect attempt #{} failed: {}", attempt + 1, e),
            }
            if !self.sleep_unless_interrupted(delay).await {
                if self.is_shut_down() {
                    debug!("shut down while reconnecting");
                    return;
                }
                debug!("output paused for too long, giving up reconnecting");
                break;
            }
        }

        if !established {
            if control.machine.on_event(ReconnectEvent::ActiveRetriesExhausted) == ReconnectAction::DeclareLost {
                self.declare_lost().await;
            }
            return;
        }

        if control.machine.on_event(ReconnectEvent::ActiveRetrySucceeded) != ReconnectAction::NotifyReconnected {
            self.disconnect();
            return;
        }

        info!("reconnected");
        if let Some(receive_strategy) = bindings.receive_strategy.upgrade() {
            receive_strategy.rebind(self);
        }
        if let Some(send_strategy) = bindings.send_strategy.upgrade() {
            if on_new_association {
                send_strategy.restart();
            }
            send_strategy.rebind(self);
            send_strategy.resume_send();
        }
        drop(control);

        if let Some(link) = bindings.link.upgrade() {
            link.on_reconnected().await;
        }
    }

    fn is_backpressure_expired(&self) -> bool {
        self.backpressure_expired.load(Ordering::Acquire)
    }

    /// Returns `false` if the connection was shut down or the backpressure timeout expired
    ///  before the delay passed
    async fn sleep_unless_interrupted(&self, delay: Duration) -> bool {
        let notified = self.interrupt_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shut_down() || self.is_backpressure_expired() {
            return false;
        }

        tokio::select! {
            _ = sleep(delay) => !self.is_shut_down() && !self.is_backpressure_expired(),
            _ = notified => false,
        }
    }

    async fn await_passive(self: &Arc<Self>, mut control: OwnedMutexGuard<ReconnectControl>) {
        self.suspend_sending();
        self.disconnect();

        let deadline = Instant::now() + self.config.passive_reconnect_duration;
        debug!("waiting {:?} for the peer to reconnect", self.config.passive_reconnect_duration);
        let span = self.span();
        control.passive_timer = Some(tokio::spawn(self.clone().on_passive_timer(deadline).instrument(span)));
        drop(control);

        if let Some(link) = self.bindings().link.upgrade() {
            link.on_disconnected().await;
        }
    }

    async fn on_passive_timer(self: Arc<Self>, deadline: Instant) {
        sleep_until(deadline).await;

        let mut control = self.reconnect.clone().lock_owned().await;
        if self.is_shut_down() || control.replaced_by.upgrade().is_some() {
            return;
        }
        control.passive_timer = None;

        if control.machine.on_event(ReconnectEvent::PassiveTimerFired) == ReconnectAction::DeclareLost {
            debug!("peer did not reconnect in time");
            self.declare_lost().await;
        }
    }

    /// Reports the loss to the link, dropping everything that waits to be sent. Called with the
    ///  reconnect lock held, so a replacing connection cannot take over halfway through.
    ///
    /// The accepting side has no way of restoring the connection, so its link is torn down.
    ///  An initiator's link stays in place and is revived by a new association.
    async fn declare_lost(&self) {
        warn!("connection {:?} lost", self.key);

        let bindings = self.bindings();
        if let Some(send_strategy) = bindings.send_strategy.upgrade() {
            send_strategy.terminate_send();
        }
        if let Some(link) = bindings.link.upgrade() {
            link.on_lost().await;
            if self.role == ConnectionRole::Acceptor {
                link.tear_down();
            }
        }
    }

    /// Takes over the link and strategies of a lost (or failing) accepting connection, returning
    ///  whether the link should report 'reconnected'.
    pub async fn copy_state_from(self: &Arc<Self>, lost: &Arc<Connection>) -> anyhow::Result<bool> {
        if self.role != ConnectionRole::Acceptor || lost.role != ConnectionRole::Acceptor {
            bail!("only accepting connections can replace each other");
        }

        let mut control = lost.reconnect.clone().lock_owned().await;
        let ReconnectAction::HandOver { notify_reconnected } = control.machine.on_event(ReconnectEvent::Replaced) else {
            bail!("connection {:?} is closed and cannot be taken over", lost.key);
        };

        if let Some(timer) = control.passive_timer.take() {
            timer.abort();
        }
        control.replaced_by = Arc::downgrade(self);

        let bindings = lost.bindings();
        *self.bindings.lock().unwrap() = bindings;
        drop(control);

        lost.disconnect();
        debug!("connection {} took over from {}", self.id, lost.id);
        Ok(notify_reconnected)
    }

    /// Declares loss when sending was paused for too long. A reconnect cycle that holds the
    ///  reconnect lock is told to stop retrying, and declares the loss itself.
    pub(crate) fn notify_lost_on_backpressure_timeout(self: &Arc<Self>) {
        let Ok(mut control) = self.reconnect.clone().try_lock_owned() else {
            debug!("reconnect in progress, telling it to give up");
            self.backpressure_expired.store(true, Ordering::Release);
            self.interrupt_notify.notify_waiters();
            return;
        };
        if control.machine.on_event(ReconnectEvent::BackpressureTimeout) != ReconnectAction::DeclareLost {
            return;
        }
        if let Some(timer) = control.passive_timer.take() {
            timer.abort();
        }

        self.disconnect();
        let this = self.clone();
        let span = self.span();
        tokio::spawn(async move {
            this.declare_lost().await;
            drop(control);
        }.instrument(span));
    }

    /// The peer sent a graceful disconnect and closed the socket of the given epoch: no
    ///  reconnect, the link is torn down
    pub(crate) fn on_graceful_disconnect(self: &Arc<Self>, epoch: u64) {
        let this = self.clone();
        let span = self.span();
        tokio::spawn(async move {
            let mut control = this.reconnect.clone().lock_owned().await;
            if !this.is_current_epoch(epoch) {
                return;
            }
            if control.machine.on_event(ReconnectEvent::GracefulClose) != ReconnectAction::Close {
                return;
            }
            drop(control);

            info!("peer disconnected gracefully");
            let bindings = this.bindings();
            if let Some(send_strategy) = bindings.send_strategy.upgrade() {
                send_strategy.terminate_send();
            }
            this.disconnect();
            if let Some(link) = bindings.link.upgrade() {
                link.on_disconnected().await;
                link.tear_down();
            }
        }.instrument(span));
    }

    /// Stops reconnecting for good and closes the socket
    pub fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("shutting down connection {:?}", self.key);
        self.interrupt_notify.notify_waiters();

        // a running reconnect cycle checks the shutdown flag itself
        if let Ok(mut control) = self.reconnect.try_lock() {
            control.machine.on_event(ReconnectEvent::Shutdown);
            if let Some(timer) = control.passive_timer.take() {
                timer.abort();
            }
        }
        self.disconnect();
    }

    #[cfg(test)]
    async fn reconnect_state(&self) -> crate::reconnect_state::ReconnectState {
        self.reconnect.lock().await.machine.state()
    }
}
