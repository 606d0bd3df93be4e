// Live client session
//
// One `Connection` wraps one accepted socket, whatever protocol it speaks;
// the kind only changes the start-up handshake. Reads and writes run on
// independent tasks: the read loop hands every chunk to the message
// observer, the write loop drains a FIFO channel so `send` never blocks and
// buffers are delivered in call order. `close` flushes pending writes,
// `force_close` drops them.

use crate::error::{GatewayError, Result};
use crate::id::ConnectionId;
use crate::network::types::{
    CloseObserver, ConnectionKind, ConnectionState, ConnectionStats, MessageObserver,
    StateObserver,
};
use crate::protocol::websocket;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

const READ_CHUNK_SIZE: usize = 4096;
const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

enum WriteCommand {
    Data(Vec<u8>),
    Shutdown { flush: bool },
}

/// A live client session owned by the connection registry.
pub struct Connection {
    id: ConnectionId,
    kind: ConnectionKind,
    peer_addr: SocketAddr,
    state: RwLock<ConnectionState>,
    stats: RwLock<ConnectionStats>,
    context: RwLock<HashMap<String, String>>,
    message_observer: RwLock<Option<MessageObserver>>,
    state_observer: RwLock<Option<StateObserver>>,
    close_observer: RwLock<Option<CloseObserver>>,
    writer_tx: mpsc::UnboundedSender<WriteCommand>,
    writer_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteCommand>>>,
    stream: Mutex<Option<TcpStream>>,
    shutdown: Notify,
    closing: AtomicBool,
    drop_pending: AtomicBool,
    socket_open: AtomicBool,
    close_notified: AtomicBool,
}

impl Connection {
    /// Wrap an accepted socket. The connection does nothing until
    /// `start` is called.
    pub fn new(
        id: ConnectionId,
        kind: ConnectionKind,
        peer_addr: SocketAddr,
        stream: TcpStream,
    ) -> Arc<Self> {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            kind,
            peer_addr,
            state: RwLock::new(ConnectionState::Connecting),
            stats: RwLock::new(ConnectionStats::new()),
            context: RwLock::new(HashMap::new()),
            message_observer: RwLock::new(None),
            state_observer: RwLock::new(None),
            close_observer: RwLock::new(None),
            writer_tx,
            writer_rx: Mutex::new(Some(writer_rx)),
            stream: Mutex::new(Some(stream)),
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
            drop_pending: AtomicBool::new(false),
            socket_open: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the underlying socket is still open.
    pub fn is_open(&self) -> bool {
        self.socket_open.load(Ordering::Acquire) || self.stream.lock().is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().clone()
    }

    /// Time since the last observed activity.
    pub fn idle_duration(&self) -> Duration {
        self.stats.read().last_activity_at.elapsed()
    }

    // ------------------------------------------------------------------
    // Context map
    // ------------------------------------------------------------------

    pub fn set_context(&self, key: impl Into<String>, value: impl Into<String>) {
        self.context.write().insert(key.into(), value.into());
    }

    pub fn context(&self, key: &str) -> Option<String> {
        self.context.read().get(key).cloned()
    }

    pub fn remove_context(&self, key: &str) -> Option<String> {
        self.context.write().remove(key)
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn set_message_observer(&self, observer: MessageObserver) {
        *self.message_observer.write() = Some(observer);
    }

    pub fn set_state_observer(&self, observer: StateObserver) {
        *self.state_observer.write() = Some(observer);
    }

    pub fn set_close_observer(&self, observer: CloseObserver) {
        *self.close_observer.write() = Some(observer);
    }

    /// Bump the received-message counter; called once per parsed message.
    pub fn record_message_received(&self) {
        let mut stats = self.stats.write();
        stats.messages_received += 1;
        stats.touch();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin asynchronous reading. For WebSocket connections the server
    /// handshake completes before the state reaches Connected.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let stream = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| GatewayError::InvalidState("connection already started".to_string()))?;
        self.socket_open.store(true, Ordering::Release);
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.run(stream).await;
        });
        Ok(())
    }

    /// Enqueue bytes for delivery. Buffers from one producer reach the
    /// socket in call order.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(GatewayError::InvalidState(format!(
                "connection {} is closing",
                self.id
            )));
        }
        self.writer_tx
            .send(WriteCommand::Data(data))
            .map_err(|_| GatewayError::Network(format!("connection {} write path gone", self.id)))
    }

    /// Graceful close: stop accepting sends, flush what is queued, shut the
    /// socket down, notify the close observer.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        let _ = self.writer_tx.send(WriteCommand::Shutdown { flush: true });
        self.shutdown.notify_one();
    }

    /// Immediate close: drop queued writes.
    pub fn force_close(&self) {
        self.drop_pending.store(true, Ordering::Release);
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.set_state(ConnectionState::Disconnecting);
        }
        let _ = self.writer_tx.send(WriteCommand::Shutdown { flush: false });
        self.shutdown.notify_one();
        // Not yet started: just drop the socket.
        if self.stream.lock().take().is_some() {
            self.finish();
        }
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state)
        };
        if old_state != new_state {
            let observer = self.state_observer.read().clone();
            if let Some(observer) = observer {
                observer(self.id, old_state, new_state);
            }
        }
    }

    /// Terminal bookkeeping; runs exactly once.
    fn finish(&self) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        self.socket_open.store(false, Ordering::Release);
        if self.state() != ConnectionState::Error {
            self.set_state(ConnectionState::Disconnected);
        }
        let observer = self.close_observer.read().clone();
        if let Some(observer) = observer {
            observer(self.id);
        }
    }

    // ------------------------------------------------------------------
    // IO driver
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>, mut stream: TcpStream) {
        let mut initial_data = Vec::new();
        if self.kind == ConnectionKind::WebSocket {
            match self.ws_handshake(&mut stream).await {
                Ok(leftover) => initial_data = leftover,
                Err(e) => {
                    warn!(connection_id = self.id, "WebSocket handshake failed: {}", e);
                    self.set_state(ConnectionState::Error);
                    self.finish();
                    return;
                }
            }
        }

        if self.closing.load(Ordering::Acquire) {
            self.finish();
            return;
        }
        self.set_state(ConnectionState::Connected);
        debug!(connection_id = self.id, kind = %self.kind, peer = %self.peer_addr, "connection started");

        let (read_half, write_half) = stream.into_split();
        let rx = self
            .writer_rx
            .lock()
            .take()
            .expect("writer receiver taken once by the IO driver");
        let writer = tokio::spawn(Arc::clone(&self).write_loop(write_half, rx));

        if !initial_data.is_empty() {
            self.deliver(&initial_data);
        }
        self.read_loop(read_half).await;

        // Let the writer flush unless a force-close dropped the queue.
        let flush = !self.drop_pending.load(Ordering::Acquire);
        let _ = self.writer_tx.send(WriteCommand::Shutdown { flush });
        let _ = writer.await;
        self.finish();
    }

    async fn read_loop(&self, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!(connection_id = self.id, "remote closed");
                        break;
                    }
                    Ok(n) => {
                        self.stats.write().record_bytes_received(n);
                        self.deliver(&buf[..n]);
                    }
                    Err(e) => {
                        warn!(connection_id = self.id, "read error: {}", e);
                        self.set_state(ConnectionState::Error);
                        break;
                    }
                },
            }
        }
        self.socket_open.store(false, Ordering::Release);
    }

    async fn write_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    ) {
        while let Some(command) = rx.recv().await {
            match command {
                WriteCommand::Data(bytes) => {
                    if self.drop_pending.load(Ordering::Acquire) {
                        continue;
                    }
                    match write_half.write_all(&bytes).await {
                        Ok(()) => {
                            let mut stats = self.stats.write();
                            stats.record_bytes_sent(bytes.len());
                            stats.messages_sent += 1;
                        }
                        Err(e) => {
                            warn!(connection_id = self.id, "write error: {}", e);
                            self.set_state(ConnectionState::Error);
                            break;
                        }
                    }
                }
                WriteCommand::Shutdown { flush } => {
                    if flush {
                        let _ = write_half.flush().await;
                    }
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    }

    fn deliver(&self, data: &[u8]) {
        let observer = self.message_observer.read().clone();
        if let Some(observer) = observer {
            observer(self.id, data);
        }
    }

    /// Server side of the RFC 6455 upgrade. Returns bytes the client sent
    /// past the end of the handshake request.
    async fn ws_handshake(&self, stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut request = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let head_end = loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(GatewayError::Network(
                    "connection closed during handshake".to_string(),
                ));
            }
            request.extend_from_slice(&buf[..n]);
            if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if request.len() > MAX_HANDSHAKE_SIZE {
                return Err(GatewayError::Parse("handshake request too large".to_string()));
            }
        };

        let head = String::from_utf8_lossy(&request[..head_end]);
        let client_key = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
                    Some(value.trim().to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                GatewayError::Parse("upgrade request missing Sec-WebSocket-Key".to_string())
            })?;

        let accept_key = websocket::compute_accept_key(&client_key);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key
        );
        stream.write_all(response.as_bytes()).await?;

        Ok(request[head_end..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(kind: ConnectionKind) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(1, kind, peer, server), client)
    }

    #[tokio::test]
    async fn test_send_is_fifo() {
        let (conn, mut client) = pair(ConnectionKind::Tcp).await;
        conn.start().unwrap();

        for i in 0..10u8 {
            conn.send(vec![i; 3]).unwrap();
        }
        let mut received = Vec::new();
        while received.len() < 30 {
            let mut buf = [0u8; 64];
            let n = client.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        let expected: Vec<u8> = (0..10u8).flat_map(|i| vec![i; 3]).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_inbound_bytes_reach_observer() {
        let (conn, mut client) = pair(ConnectionKind::Tcp).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_message_observer(Arc::new(move |id, data: &[u8]| {
            let _ = tx.send((id, data.to_vec()));
        }));
        conn.start().unwrap();

        client.write_all(b"hello observer").await.unwrap();
        let (id, data) = rx.recv().await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(data, b"hello observer");
        assert!(conn.stats().bytes_received >= 14);
    }

    #[tokio::test]
    async fn test_close_fires_observer_once_and_flushes() {
        let (conn, mut client) = pair(ConnectionKind::Tcp).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_close_observer(Arc::new(move |id| {
            let _ = tx.send(id);
        }));
        conn.start().unwrap();

        conn.send(b"last words".to_vec()).unwrap();
        conn.close();
        conn.close();

        let mut received = Vec::new();
        loop {
            let mut buf = [0u8; 64];
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        assert_eq!(received, b"last words");
        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_connected());
        assert!(conn.send(b"too late".to_vec()).is_err());
    }

    #[tokio::test]
    async fn test_remote_close_transitions_to_disconnected() {
        let (conn, client) = pair(ConnectionKind::Tcp).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_close_observer(Arc::new(move |id| {
            let _ = tx.send(id);
        }));
        conn.start().unwrap();

        drop(client);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_state_observer_sees_transitions() {
        let (conn, _client) = pair(ConnectionKind::Tcp).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.set_state_observer(Arc::new(move |_, old, new| {
            let _ = tx.send((old, new));
        }));
        conn.start().unwrap();

        assert_eq!(
            rx.recv().await,
            Some((ConnectionState::Connecting, ConnectionState::Connected))
        );
    }

    #[tokio::test]
    async fn test_websocket_handshake_accept_key() {
        let (conn, mut client) = pair(ConnectionKind::WebSocket).await;
        conn.start().unwrap();

        client
            .write_all(
                b"GET /chat HTTP/1.1\r\n\
                  Host: example\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let mut buf = [0u8; 256];
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            response.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[tokio::test]
    async fn test_context_map() {
        let (conn, _client) = pair(ConnectionKind::Tcp).await;
        conn.set_context("user_id", "42");
        assert_eq!(conn.context("user_id").as_deref(), Some("42"));
        assert_eq!(conn.remove_context("user_id").as_deref(), Some("42"));
        assert!(conn.context("user_id").is_none());
    }
}
