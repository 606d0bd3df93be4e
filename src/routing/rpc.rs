// Routing RPC contract and transport
//
// Wire format: length-prefixed frames, `u32` big endian, first payload byte
// is the operation code, the rest is a bincode-encoded body. Three
// operations: unary RouteMessage, per-item streaming BatchRouteMessages,
// and CheckStatus. Responses echo the request's operation code;
// correspondence inside a batch is held by `message_id`.

use crate::error::{GatewayError, Result};
use crate::routing::router::MessageRouter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// RouteMessage operation code.
pub const OP_ROUTE: u8 = 1;
/// BatchRouteMessages item operation code.
pub const OP_BATCH: u8 = 2;
/// CheckStatus operation code.
pub const OP_STATUS: u8 = 3;

/// Largest accepted RPC frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Outcome codes reported in a `RouteResponse`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum ErrorCode {
    Success,
    InvalidRequest,
    ServiceUnavailable,
    InternalError,
}

/// Request to route one message toward a target service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RouteRequest {
    pub message_id: String,
    pub target_service: String,
    pub payload: Vec<u8>,
    pub priority: i32,
}

impl RouteRequest {
    pub fn new(message_id: impl Into<String>, target_service: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            target_service: target_service.into(),
            payload: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Routing outcome. Reports whether routing succeeded, not downstream
/// processing.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RouteResponse {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_message: String,
    pub accepted: bool,
}

impl RouteResponse {
    pub fn success(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            error_code: ErrorCode::Success,
            error_message: "Success".to_string(),
            accepted: true,
        }
    }

    pub fn error(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_message: error_message.into(),
            accepted: false,
        }
    }
}

/// Service health snapshot returned by CheckStatus.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct StatusResponse {
    pub is_healthy: bool,
    pub queue_size: u64,
    pub uptime_seconds: u64,
}

// ----------------------------------------------------------------------
// Frame IO
// ----------------------------------------------------------------------

/// Write one `[len][op][bincode body]` frame.
pub async fn write_frame<W, T>(writer: &mut W, op: u8, body: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: bincode::Encode,
{
    let encoded = bincode::encode_to_vec(body, bincode::config::standard())?;
    let len = (encoded.len() + 1) as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[op]).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, returning the operation code and the body bytes.
pub async fn read_frame<R>(reader: &mut R) -> Result<(u8, Vec<u8>)>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(GatewayError::Parse(format!("bad RPC frame length {}", len)));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    let body = frame.split_off(1);
    Ok((frame[0], body))
}

/// Decode a frame body.
pub fn decode_body<T: bincode::Decode<()>>(body: &[u8]) -> Result<T> {
    let (value, _) = bincode::decode_from_slice(body, bincode::config::standard())?;
    Ok(value)
}

// ----------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------

/// RPC front of the routing service.
pub struct RoutingRpcServer {
    router: Arc<MessageRouter>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: RwLock<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoutingRpcServer {
    pub fn new(router: Arc<MessageRouter>) -> Arc<Self> {
        Arc::new(Self {
            router,
            listener: Mutex::new(None),
            local_addr: RwLock::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Bind the RPC listener. Port 0 picks an ephemeral port.
    pub async fn bind(&self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port))
            .await
            .map_err(|e| GatewayError::Network(format!("failed to bind RPC listener: {}", e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        info!(addr = %local, "routing RPC listening");
        *self.local_addr.write() = Some(local);
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Start accepting RPC connections.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| GatewayError::InvalidState("RPC server not bound".to_string()))?;
        let server = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "RPC client connected");
                        let router = Arc::clone(&server.router);
                        tokio::spawn(async move {
                            if let Err(e) = handle_rpc_connection(router, stream).await {
                                debug!(peer = %peer, "RPC connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("RPC accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        *self.listener.lock() = None;
    }
}

/// Serve one RPC connection until the peer disconnects. Route work goes
/// through the router's priority queue; the worker's callback resolves a
/// oneshot that completes the pending frame.
async fn handle_rpc_connection(router: Arc<MessageRouter>, stream: TcpStream) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    loop {
        let (op, body) = match read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(GatewayError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match op {
            OP_ROUTE | OP_BATCH => {
                let request: RouteRequest = decode_body(&body)?;
                let message_id = request.message_id.clone();
                let (tx, rx) = oneshot::channel();
                router.submit(
                    request,
                    Box::new(move |response| {
                        let _ = tx.send(response);
                    }),
                );
                let response = rx.await.unwrap_or_else(|_| {
                    RouteResponse::error(
                        message_id,
                        ErrorCode::InternalError,
                        "routing worker dropped the request",
                    )
                });
                write_frame(&mut write_half, op, &response).await?;
            }
            OP_STATUS => {
                let status = router.check_status();
                write_frame(&mut write_half, OP_STATUS, &status).await?;
            }
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unknown RPC op {}",
                    other
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let request = RouteRequest::new("m1", "chat")
            .with_payload(b"hello".to_vec())
            .with_priority(3);

        let (client, server) = tokio::io::duplex(1024);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, _server_write) = tokio::io::split(server);

        write_frame(&mut client_write, OP_ROUTE, &request).await.unwrap();
        let (op, body) = read_frame(&mut server_read).await.unwrap();
        assert_eq!(op, OP_ROUTE);
        let decoded: RouteRequest = decode_body(&body).unwrap();
        assert_eq!(decoded.message_id, "m1");
        assert_eq!(decoded.target_service, "chat");
        assert_eq!(decoded.payload, b"hello");
        assert_eq!(decoded.priority, 3);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, _server_write) = tokio::io::split(server);

        client_write.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(read_frame(&mut server_read).await.is_err());
    }

    #[test]
    fn test_response_constructors() {
        let ok = RouteResponse::success("id1");
        assert!(ok.accepted);
        assert_eq!(ok.error_code, ErrorCode::Success);

        let err = RouteResponse::error("id2", ErrorCode::ServiceUnavailable, "nope");
        assert!(!err.accepted);
        assert_eq!(err.error_code, ErrorCode::ServiceUnavailable);
        assert_eq!(err.message_id, "id2");
    }
}
