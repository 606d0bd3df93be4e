// Protocol acceptors
//
// One acceptor per listening endpoint. Every accepted socket gets a fresh
// connection id, the gateway's observers, and a registry slot; if the
// registry is full the socket is force-closed and dropped.

use crate::error::{GatewayError, Result};
use crate::id::IdGenerator;
use crate::network::connection::Connection;
use crate::network::registry::ConnectionRegistry;
use crate::network::types::{CloseObserver, ConnectionKind, MessageObserver, StateObserver};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The observer set installed on every accepted connection.
#[derive(Clone)]
pub struct ConnectionObservers {
    pub on_message: MessageObserver,
    pub on_state_change: StateObserver,
    pub on_close: CloseObserver,
}

/// Accept loop for one protocol endpoint.
pub struct Acceptor {
    kind: ConnectionKind,
    ids: Arc<IdGenerator>,
    registry: Arc<ConnectionRegistry>,
    observers: ConnectionObservers,
    listener: Mutex<Option<TcpListener>>,
    local_addr: RwLock<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    pub fn new(
        kind: ConnectionKind,
        ids: Arc<IdGenerator>,
        registry: Arc<ConnectionRegistry>,
        observers: ConnectionObservers,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            ids,
            registry,
            observers,
            listener: Mutex::new(None),
            local_addr: RwLock::new(None),
            accept_task: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Bind the listening socket. Port 0 picks an ephemeral port,
    /// readable afterwards through `local_addr`.
    pub async fn bind(&self, port: u16) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", port)
            .parse()
            .map_err(|e| GatewayError::Configuration(format!("bad listen address: {}", e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Network(format!("failed to bind {} listener: {}", self.kind, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        info!(kind = %self.kind, addr = %local, "listener bound");
        *self.local_addr.write() = Some(local);
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    /// The bound address, once `bind` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Start the accept loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| GatewayError::InvalidState("acceptor not bound".to_string()))?;
        let acceptor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            acceptor.accept_loop(listener).await;
        });
        *self.accept_task.lock() = Some(handle);
        Ok(())
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let id = self.ids.next_connection_id();
                    let connection = Connection::new(id, self.kind, peer_addr, stream);
                    connection.set_message_observer(self.observers.on_message.clone());
                    connection.set_state_observer(self.observers.on_state_change.clone());
                    connection.set_close_observer(self.observers.on_close.clone());

                    if let Err(e) = self.registry.add(Arc::clone(&connection)) {
                        warn!(kind = %self.kind, peer = %peer_addr, "rejecting connection: {}", e);
                        connection.force_close();
                        continue;
                    }
                    if let Err(e) = connection.start() {
                        warn!(connection_id = id, "failed to start connection: {}", e);
                        self.registry.remove(id);
                    }
                }
                Err(e) => {
                    warn!(kind = %self.kind, "accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Stop accepting. Existing connections are unaffected.
    pub fn stop(&self) {
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        *self.listener.lock() = None;
    }
}
