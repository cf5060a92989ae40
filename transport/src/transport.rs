use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::connector::{apply_socket_tuning, StreamConnector, TcpConnector};
use crate::data_link::DataLink;
use crate::link_key::LinkKey;
use crate::listener::TransportListener;
use crate::pending_connections::PendingConnections;
use crate::reconnect_checker::ReconnectChecker;
use crate::stream_socket::StreamSocket;

/// The entry point: owns the acceptor socket and the registry of links, and creates links on
///  demand.
///
/// Each pair of nodes has one link per priority and direction. The side that was asked to
///  connect as initiator opens the TCP connection (and restores it after a loss), the other
///  side waits for the initiator to connect.
pub struct Transport {
    config: Arc<TransportConfig>,
    listener: Arc<dyn TransportListener>,
    connector: Arc<dyn StreamConnector>,
    local_addr: SocketAddr,
    public_addr: SocketAddr,

    links: Mutex<FxHashMap<LinkKey, Arc<DataLink>>>,
    pending_connections: PendingConnections,
    reconnect_checker: ReconnectChecker,
    accept_loop: Mutex<Option<JoinHandle<()>>>,

    is_shut_down: AtomicBool,
}

impl Transport {
    pub async fn bind(config: TransportConfig, listener: Arc<dyn TransportListener>) -> anyhow::Result<Arc<Transport>> {
        let connector = Arc::new(TcpConnector::new(&config));
        Self::bind_with_connector(config, listener, connector).await
    }

    pub async fn bind_with_connector(config: TransportConfig, listener: Arc<dyn TransportListener>, connector: Arc<dyn StreamConnector>) -> anyhow::Result<Arc<Transport>> {
        config.validate()?;

        let tcp_listener = TcpListener::bind(config.local_address).await?;
        let local_addr = tcp_listener.local_addr()?;
        let public_addr = config.public_address.unwrap_or(local_addr);
        if public_addr.ip().is_unspecified() || public_addr.port() == 0 {
            bail!("{:?} cannot be announced to peers, please configure a public address", public_addr);
        }
        info!("bound transport to {:?}, announcing {:?}", local_addr, public_addr);

        let transport = Arc::new_cyclic(|transport: &Weak<Transport>| Transport {
            config: Arc::new(config),
            listener,
            connector,
            local_addr,
            public_addr,
            links: Default::default(),
            pending_connections: Default::default(),
            reconnect_checker: ReconnectChecker::spawn(transport.clone()),
            accept_loop: Mutex::new(None),
            is_shut_down: AtomicBool::new(false),
        });

        let span = info_span!("accept_loop", %local_addr);
        let accept_loop = tokio::spawn(Self::accept_loop(Arc::downgrade(&transport), tcp_listener).instrument(span));
        *transport.accept_loop.lock().unwrap() = Some(accept_loop);

        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn pending_connection_count(&self) -> usize {
        self.pending_connections.len()
    }

    fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }

    async fn accept_loop(transport: Weak<Transport>, tcp_listener: TcpListener) {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let Some(transport) = transport.upgrade() else {
                        return;
                    };
                    trace!("accepted TCP connection from {:?}", peer_addr);
                    if let Err(e) = apply_socket_tuning(&stream, &transport.config.socket) {
                        warn!("error configuring socket accepted from {:?}, closing it: {}", peer_addr, e);
                        continue;
                    }

                    let span = info_span!("handshake", %peer_addr);
                    tokio::spawn(transport.on_accepted(Arc::new(stream), peer_addr).instrument(span));
                }
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                    // e.g. running out of file descriptors: give the system a moment
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn on_accepted(self: Arc<Self>, socket: Arc<dyn StreamSocket>, peer_addr: SocketAddr) {
        match Connection::passive_open(socket, self.config.clone(), self.connector.clone(), self.public_addr).await {
            Ok(connection) => self.reconnect_checker.enqueue(connection),
            Err(e) => debug!("rejecting connection from {:?}: {}", peer_addr, e),
        }
    }

    /// Matches a freshly accepted connection with its link: it replaces the connection of an
    ///  established link, and is parked for a link that waits for it (or will ask for it later)
    pub(crate) async fn passive_connection(&self, connection: Arc<Connection>) {
        if self.is_shut_down() {
            connection.shutdown();
            return;
        }

        let key = connection.key();
        let link = self.links.lock().unwrap()
            .get(&key)
            .cloned();

        if let Some(link) = link {
            if link.connection().is_some() {
                debug!("accepted connection {:?} for an existing link", key);
                match link.reconnect(connection.clone()).await {
                    Ok(()) => return,
                    Err(e) => debug!("accepted connection could not take over: {}", e),
                }
            }
        }

        self.pending_connections.insert(connection);
    }

    /// Returns the link to a peer, creating and connecting it if necessary. Several associations
    ///  share a link, see [Self::release_channel].
    pub async fn find_or_create_channel(self: &Arc<Self>, remote_addr: SocketAddr, priority: u32, connect_as_initiator: bool) -> anyhow::Result<Arc<DataLink>> {
        if self.is_shut_down() {
            bail!("transport is shut down");
        }

        let key = LinkKey::new(remote_addr, priority, connect_as_initiator);
        let (link, is_new) = {
            let mut links = self.links.lock().unwrap();
            // a released link is on its way out of the registry, and is replaced like a missing one
            match links.get(&key).filter(|l| !l.is_released()) {
                Some(link) => {
                    link.add_association();
                    (link.clone(), false)
                }
                None => {
                    let link = DataLink::new(key, self.config.clone(), self.listener.clone(), Arc::downgrade(self));
                    links.insert(key, link.clone());
                    (link, true)
                }
            }
        };

        if !is_new {
            trace!("reusing link {:?}", key);
            if connect_as_initiator {
                if let Some(connection) = link.connection() {
                    if !connection.is_connected() {
                        connection.reconnect(true).await;
                    }
                }
            }
            return Ok(link);
        }

        let connect_result = if connect_as_initiator {
            self.make_active_connection(&link).await
        }
        else {
            self.make_passive_connection(&link).await
        };

        if let Err(e) = connect_result {
            debug!("could not connect link {:?}: {}", key, e);
            link.tear_down();
            return Err(e);
        }
        Ok(link)
    }

    async fn make_active_connection(&self, link: &Arc<DataLink>) -> anyhow::Result<()> {
        let connection = Connection::new(link.key(), self.public_addr, self.config.clone(), self.connector.clone());
        connection.active_establish().await?;
        self.bind_connection(link, connection).await
    }

    async fn make_passive_connection(&self, link: &Arc<DataLink>) -> anyhow::Result<()> {
        // the deadline is computed once, spurious wakeups do not extend it
        let deadline = self.config.passive_connect_timeout()
            .map(|timeout| Instant::now() + timeout);
        let connection = self.pending_connections.wait_for(&link.key(), deadline).await?;
        self.bind_connection(link, connection).await
    }

    async fn bind_connection(&self, link: &Arc<DataLink>, connection: Arc<Connection>) -> anyhow::Result<()> {
        if let Err(e) = link.connect(connection.clone()).await {
            connection.shutdown();
            return Err(e);
        }
        Ok(())
    }

    /// Drops one association, releasing the link with its last association
    pub fn release_channel(&self, link: &Arc<DataLink>) {
        if link.release_association() {
            link.release();
        }
    }

    /// Removes a link from the registry unless it was replaced by a newer link meanwhile
    pub(crate) fn remove_link(&self, key: &LinkKey, link_id: Uuid) {
        let mut links = self.links.lock().unwrap();
        if links.get(key).is_some_and(|l| l.id() == link_id) {
            debug!("removing link {:?}", key);
            links.remove(key);
        }
    }

    /// Stops accepting connections and releases all links
    pub fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down transport on {:?}", self.local_addr);

        if let Some(accept_loop) = self.accept_loop.lock().unwrap().take() {
            accept_loop.abort();
        }
        self.reconnect_checker.close();
        self.pending_connections.close();

        let links = self.links.lock().unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for link in links {
            link.release();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(accept_loop) = self.accept_loop.lock().unwrap().take() {
            accept_loop.abort();
        }
        self.reconnect_checker.close();
    }
}
