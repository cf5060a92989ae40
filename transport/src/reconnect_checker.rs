use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};
use crate::connection::Connection;
use crate::transport::Transport;

/// Hands freshly accepted connections to the transport on a task of its own. Matching an
///  accepted connection to its link may wait for the link's reconnect lock, and the accept loop
///  must never wait for that.
pub struct ReconnectChecker {
    tx: mpsc::UnboundedSender<Arc<Connection>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectChecker {
    pub fn spawn(transport: Weak<Transport>) -> ReconnectChecker {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Connection>>();

        let task = tokio::spawn(async move {
            while let Some(connection) = rx.recv().await {
                let Some(transport) = transport.upgrade() else {
                    connection.shutdown();
                    return;
                };
                transport.passive_connection(connection).await;
            }
            debug!("reconnect checker finished");
        }.instrument(info_span!("reconnect_checker")));

        ReconnectChecker {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn enqueue(&self, connection: Arc<Connection>) {
        if let Err(e) = self.tx.send(connection) {
            debug!("reconnect checker is closed, dropping accepted connection");
            e.0.shutdown();
        }
    }

    pub fn close(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}
