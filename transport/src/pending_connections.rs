use std::sync::{Arc, Mutex};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use crate::connection::Connection;
use crate::link_key::LinkKey;

#[derive(Default)]
struct PendingInner {
    connections: FxHashMap<LinkKey, Arc<Connection>>,
    closed: bool,
}

/// Accepted connections that no link has claimed yet. A passive find-or-create waits here for
///  the peer to connect, and an accept that happens before anybody waits is parked until a link
///  claims it.
#[derive(Default)]
pub struct PendingConnections {
    inner: Mutex<PendingInner>,
    changed: Notify,
}

impl PendingConnections {
    /// A newer connection for the same key replaces (and closes) an older one
    pub fn insert(&self, connection: Arc<Connection>) {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                drop(inner);
                connection.shutdown();
                return;
            }
            inner.connections.insert(connection.key(), connection)
        };

        if let Some(previous) = previous {
            debug!("replacing pending connection {:?}", previous.key());
            previous.shutdown();
        }
        self.changed.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    /// Waits for a connection with the given key and claims it. `None` for the deadline waits
    ///  indefinitely.
    pub async fn wait_for(&self, key: &LinkKey, deadline: Option<Instant>) -> anyhow::Result<Arc<Connection>> {
        match deadline {
            Some(deadline) => timeout_at(deadline, self.do_wait_for(key)).await
                .map_err(|_| anyhow!("timeout waiting for {:?} to connect", key))?,
            None => self.do_wait_for(key).await,
        }
    }

    async fn do_wait_for(&self, key: &LinkKey) -> anyhow::Result<Arc<Connection>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    bail!("shut down while waiting for {:?} to connect", key);
                }
                if let Some(connection) = inner.connections.remove(key) {
                    return Ok(connection);
                }
            }

            notified.await;
        }
    }

    /// Shuts down all pending connections and fails current and future waits
    pub fn close(&self) {
        let connections = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.connections.drain()
                .map(|(_, c)| c)
                .collect::<Vec<_>>()
        };
        for connection in connections {
            connection.shutdown();
        }
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use crate::config::TransportConfig;
    use crate::connector::MockStreamConnector;

    fn key(port: u16) -> LinkKey {
        LinkKey::new(SocketAddr::from(([10,0,0,2], port)), 0, false)
    }

    fn connection(key: LinkKey) -> Arc<Connection> {
        let config = TransportConfig::new(SocketAddr::from(([10,0,0,1], 7000)));
        Connection::new(key, config.local_address, Arc::new(config), Arc::new(MockStreamConnector::new()))
    }

    #[tokio::test]
    async fn test_insert_before_wait() {
        let pending = PendingConnections::default();
        let c = connection(key(1));
        pending.insert(c.clone());
        assert_eq!(pending.len(), 1);

        let claimed = pending.wait_for(&key(1), None).await.unwrap();
        assert!(Arc::ptr_eq(&claimed, &c));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_wait_before_insert() {
        let pending = Arc::new(PendingConnections::default());
        let c = connection(key(1));

        let p = pending.clone();
        let waiter = tokio::spawn(async move {
            p.wait_for(&key(1), Some(Instant::now() + Duration::from_secs(10))).await
        });
        tokio::task::yield_now().await;

        pending.insert(connection(key(2)));
        pending.insert(c.clone());

        let claimed = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&claimed, &c));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let pending = PendingConnections::default();
        pending.insert(connection(key(2)));

        let start = Instant::now();
        let result = pending.wait_for(&key(1), Some(start + Duration::from_millis(300))).await;
        assert!(result.is_err());
        assert_eq!(Instant::now() - start, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_newer_connection_replaces_older() {
        let pending = PendingConnections::default();
        let older = connection(key(1));
        let newer = connection(key(1));

        pending.insert(older.clone());
        pending.insert(newer.clone());

        assert_eq!(pending.len(), 1);
        assert!(older.is_shut_down());
        let claimed = pending.wait_for(&key(1), None).await.unwrap();
        assert!(Arc::ptr_eq(&claimed, &newer));
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let pending = Arc::new(PendingConnections::default());
        let parked = connection(key(2));
        pending.insert(parked.clone());

        let p = pending.clone();
        let waiter = tokio::spawn(async move {
            p.wait_for(&key(1), None).await
        });
        tokio::task::yield_now().await;

        pending.close();
        assert!(waiter.await.unwrap().is_err());
        assert!(parked.is_shut_down());

        let late = connection(key(1));
        pending.insert(late.clone());
        assert!(late.is_shut_down());
        assert_eq!(pending.len(), 0);
    }
}
