// Registry of live connections
//
// Thread-safe map from connection id to session, with capacity enforcement,
// typed queries, aggregate statistics, and a periodic cleanup task that
// sweeps closed sockets, evicts idle connections, and refreshes stats.
// Everything else in the process refers to connections by id and resolves
// them here.

use crate::error::{GatewayError, Result};
use crate::id::ConnectionId;
use crate::network::connection::Connection;
use crate::network::types::{
    AggregateStats, ConnectionEvent, ConnectionKind, ConnectionState, EventObserver,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Tunables applied by the gateway at initialization.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub enable_statistics: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
            enable_statistics: true,
        }
    }
}

/// Thread-safe table of live connections keyed by id.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    config: RwLock<RegistryConfig>,
    total_count: AtomicUsize,
    tcp_count: AtomicUsize,
    websocket_count: AtomicUsize,
    http_count: AtomicUsize,
    stats: Mutex<AggregateStats>,
    event_observer: RwLock<Option<EventObserver>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            total_count: AtomicUsize::new(0),
            tcp_count: AtomicUsize::new(0),
            websocket_count: AtomicUsize::new(0),
            http_count: AtomicUsize::new(0),
            stats: Mutex::new(AggregateStats::default()),
            event_observer: RwLock::new(None),
            cleanup_task: Mutex::new(None),
        })
    }

    /// Replace the registry tunables.
    pub fn configure(&self, config: RegistryConfig) {
        *self.config.write() = config;
    }

    pub fn set_event_observer(&self, observer: EventObserver) {
        *self.event_observer.write() = Some(observer);
    }

    fn kind_counter(&self, kind: ConnectionKind) -> &AtomicUsize {
        match kind {
            ConnectionKind::Tcp => &self.tcp_count,
            ConnectionKind::WebSocket => &self.websocket_count,
            ConnectionKind::Http => &self.http_count,
        }
    }

    fn notify(&self, id: ConnectionId, event: ConnectionEvent) {
        let observer = self.event_observer.read().clone();
        if let Some(observer) = observer {
            observer(id, event);
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Register a connection. Fails when the table is at capacity or the
    /// id is already present; counters are bumped atomically with the
    /// insertion.
    pub fn add(&self, connection: Arc<Connection>) -> Result<()> {
        let id = connection.id();
        let kind = connection.kind();
        {
            let mut connections = self.connections.write();
            let max = self.config.read().max_connections;
            if connections.len() >= max {
                return Err(GatewayError::Capacity(format!(
                    "connection limit {} reached",
                    max
                )));
            }
            if connections.contains_key(&id) {
                return Err(GatewayError::AlreadyExists(format!("connection {}", id)));
            }
            connections.insert(id, connection);
            self.total_count.fetch_add(1, Ordering::Relaxed);
            self.kind_counter(kind).fetch_add(1, Ordering::Relaxed);
        }
        debug!(connection_id = id, kind = %kind, "connection registered");
        self.notify(id, ConnectionEvent::Connected);
        Ok(())
    }

    /// Remove a connection. Idempotent.
    pub fn remove(&self, id: ConnectionId) {
        let removed = {
            let mut connections = self.connections.write();
            connections.remove(&id)
        };
        if let Some(connection) = removed {
            self.total_count.fetch_sub(1, Ordering::Relaxed);
            self.kind_counter(connection.kind())
                .fetch_sub(1, Ordering::Relaxed);
            debug!(connection_id = id, "connection removed");
            self.notify(id, ConnectionEvent::Removed);
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Snapshot of connections of one kind.
    pub fn by_kind(&self, kind: ConnectionKind) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    /// Snapshot of connections in one state.
    pub fn by_state(&self, state: ConnectionState) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .filter(|c| c.state() == state)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.total_count.load(Ordering::Relaxed)
    }

    pub fn connection_count_by_kind(&self, kind: ConnectionKind) -> usize {
        self.kind_counter(kind).load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------

    /// Close every live connection. Entries leave the table through the
    /// close observer path.
    pub fn close_all(&self) {
        let snapshot = self.all();
        info!(count = snapshot.len(), "closing all connections");
        for connection in snapshot {
            connection.close();
        }
    }

    pub fn close_by_kind(&self, kind: ConnectionKind) {
        for connection in self.by_kind(kind) {
            connection.close();
        }
    }

    /// Close connections idle for at least `timeout`.
    pub fn close_idle(&self, timeout: Duration) {
        for connection in self.all() {
            if connection.idle_duration() >= timeout {
                debug!(
                    connection_id = connection.id(),
                    idle_secs = connection.idle_duration().as_secs(),
                    "closing idle connection"
                );
                connection.close();
            }
        }
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn aggregate_stats(&self) -> AggregateStats {
        self.stats.lock().clone()
    }

    /// Recompute aggregate statistics from every live connection.
    pub fn refresh_stats(&self) {
        if !self.config.read().enable_statistics {
            return;
        }
        let mut totals = AggregateStats::default();
        for connection in self.all() {
            let stats = connection.stats();
            totals.total_bytes_sent += stats.bytes_sent;
            totals.total_bytes_received += stats.bytes_received;
            totals.total_messages_sent += stats.messages_sent;
            totals.total_messages_received += stats.messages_received;
        }
        *self.stats.lock() = totals;
    }

    // ------------------------------------------------------------------
    // Cleanup task
    // ------------------------------------------------------------------

    /// Start the periodic cleanup task: drop entries whose socket is
    /// closed, evict idle connections, refresh aggregate statistics.
    pub fn start_cleanup(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let interval = self.config.read().cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.run_cleanup_pass();
            }
        });
        let mut slot = self.cleanup_task.lock();
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// One cleanup pass; also invoked directly by tests.
    pub fn run_cleanup_pass(&self) {
        let closed: Vec<ConnectionId> = self
            .all()
            .into_iter()
            .filter(|c| !c.is_open())
            .map(|c| c.id())
            .collect();
        for id in closed {
            self.remove(id);
        }

        let idle_timeout = self.config.read().idle_timeout;
        self.close_idle(idle_timeout);
        self.refresh_stats();
    }

    /// Stop the cleanup task.
    pub fn stop_cleanup(&self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connection(id: ConnectionId, kind: ConnectionKind) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(id, kind, peer, server), client)
    }

    fn registry(max: usize) -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(RegistryConfig {
            max_connections: max,
            ..RegistryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = registry(10);
        let (conn, _client) = connection(1, ConnectionKind::Tcp).await;
        registry.add(Arc::clone(&conn)).unwrap();

        assert!(registry.get(1).is_some());
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.connection_count_by_kind(ConnectionKind::Tcp), 1);

        registry.remove(1);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.connection_count(), 0);
        // Idempotent.
        registry.remove(1);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = registry(1);
        let (a, _ca) = connection(1, ConnectionKind::Tcp).await;
        let (b, _cb) = connection(2, ConnectionKind::Tcp).await;
        registry.add(a).unwrap();
        let err = registry.add(b).unwrap_err();
        assert!(matches!(err, GatewayError::Capacity(_)));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = registry(10);
        let (a, _ca) = connection(7, ConnectionKind::Tcp).await;
        let (b, _cb) = connection(7, ConnectionKind::Http).await;
        registry.add(a).unwrap();
        let err = registry.add(b).unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyExists(_)));
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_per_kind_counts_sum_to_total() {
        let registry = registry(10);
        let (a, _ca) = connection(1, ConnectionKind::Tcp).await;
        let (b, _cb) = connection(2, ConnectionKind::WebSocket).await;
        let (c, _cc) = connection(3, ConnectionKind::Http).await;
        let (d, _cd) = connection(4, ConnectionKind::Tcp).await;
        for conn in [a, b, c, d] {
            registry.add(conn).unwrap();
        }

        let sum = registry.connection_count_by_kind(ConnectionKind::Tcp)
            + registry.connection_count_by_kind(ConnectionKind::WebSocket)
            + registry.connection_count_by_kind(ConnectionKind::Http);
        assert_eq!(sum, registry.connection_count());
        assert_eq!(registry.connection_count(), 4);

        registry.remove(2);
        let sum = registry.connection_count_by_kind(ConnectionKind::Tcp)
            + registry.connection_count_by_kind(ConnectionKind::WebSocket)
            + registry.connection_count_by_kind(ConnectionKind::Http);
        assert_eq!(sum, registry.connection_count());
    }

    #[tokio::test]
    async fn test_queries_by_kind_and_state() {
        let registry = registry(10);
        let (a, _ca) = connection(1, ConnectionKind::Tcp).await;
        let (b, _cb) = connection(2, ConnectionKind::WebSocket).await;
        registry.add(Arc::clone(&a)).unwrap();
        registry.add(b).unwrap();

        assert_eq!(registry.by_kind(ConnectionKind::Tcp).len(), 1);
        assert_eq!(registry.by_state(ConnectionState::Connecting).len(), 2);
        assert!(registry.by_state(ConnectionState::Connected).is_empty());
    }

    #[tokio::test]
    async fn test_events_fire_on_add_and_remove() {
        let registry = registry(10);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.set_event_observer(Arc::new(move |id, event| {
            let _ = tx.send((id, event));
        }));

        let (conn, _client) = connection(5, ConnectionKind::Tcp).await;
        registry.add(conn).unwrap();
        registry.remove(5);

        assert_eq!(rx.recv().await, Some((5, ConnectionEvent::Connected)));
        assert_eq!(rx.recv().await, Some((5, ConnectionEvent::Removed)));
    }

    #[tokio::test]
    async fn test_close_by_kind_scopes_to_kind() {
        let registry = registry(10);
        let (tcp_conn, _ct) = connection(1, ConnectionKind::Tcp).await;
        let (ws_conn, _cw) = connection(2, ConnectionKind::WebSocket).await;
        registry.add(Arc::clone(&tcp_conn)).unwrap();
        registry.add(Arc::clone(&ws_conn)).unwrap();

        registry.close_by_kind(ConnectionKind::Tcp);
        assert_eq!(tcp_conn.state(), ConnectionState::Disconnecting);
        assert_eq!(ws_conn.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_cleanup_pass_drops_closed_sockets() {
        let registry = registry(10);
        let (conn, client) = connection(1, ConnectionKind::Tcp).await;
        conn.start().unwrap();
        registry.add(Arc::clone(&conn)).unwrap();

        drop(client);
        // Wait for the read loop to observe the close.
        tokio::time::timeout(Duration::from_secs(1), async {
            while conn.is_open() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        registry.run_cleanup_pass();
        assert!(registry.get(1).is_none());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_stats_aggregates() {
        let registry = registry(10);
        let (conn, mut client) = connection(1, ConnectionKind::Tcp).await;
        conn.start().unwrap();
        registry.add(Arc::clone(&conn)).unwrap();

        conn.send(b"12345".to_vec()).unwrap();
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 16];
        client.read_exact(&mut buf[..5]).await.unwrap();

        registry.refresh_stats();
        let stats = registry.aggregate_stats();
        assert_eq!(stats.total_bytes_sent, 5);
        assert_eq!(stats.total_messages_sent, 1);
    }
}
