// Gateway-side client for the routing RPC
//
// One lazily connected TCP stream guarded by an async mutex; a broken
// connection is dropped and redialed once per call. Deadlines follow the
// operation: routing calls get 5 seconds, status probes 2.

use crate::error::{GatewayError, Result};
use crate::routing::rpc::{
    self, RouteRequest, RouteResponse, StatusResponse, OP_BATCH, OP_ROUTE, OP_STATUS,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

const ROUTE_DEADLINE: Duration = Duration::from_secs(5);
const STATUS_DEADLINE: Duration = Duration::from_secs(2);

/// RPC client for the routing service.
pub struct RoutingClient {
    endpoint: String,
    stream: Mutex<Option<TcpStream>>,
}

impl RoutingClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            stream: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Route one message. Unary call with a 5 second deadline.
    pub async fn route_message(&self, request: &RouteRequest) -> Result<RouteResponse> {
        let (op, body) = self
            .call(OP_ROUTE, request, ROUTE_DEADLINE)
            .await?;
        if op != OP_ROUTE {
            return Err(GatewayError::Network(format!("unexpected RPC op {}", op)));
        }
        rpc::decode_body(&body)
    }

    /// Stream a batch of requests and collect one response per request.
    /// Correspondence is by `message_id`.
    pub async fn batch_route(&self, requests: &[RouteRequest]) -> Result<Vec<RouteResponse>> {
        let mut guard = self.stream.lock().await;
        let deadline = ROUTE_DEADLINE * (requests.len().max(1) as u32);
        let attempt = tokio::time::timeout(deadline, async {
            let stream = self.connected(&mut guard).await?;
            for request in requests {
                rpc::write_frame(stream, OP_BATCH, request).await?;
            }
            let mut responses = Vec::with_capacity(requests.len());
            for _ in requests {
                let (op, body) = rpc::read_frame(stream).await?;
                if op != OP_BATCH {
                    return Err(GatewayError::Network(format!("unexpected RPC op {}", op)));
                }
                responses.push(rpc::decode_body(&body)?);
            }
            Ok(responses)
        })
        .await;

        match attempt {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(e)) => {
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(GatewayError::Timeout("batch route".to_string()))
            }
        }
    }

    /// Probe the routing service with a 2 second deadline.
    pub async fn check_status(&self) -> Result<StatusResponse> {
        let (op, body) = self.call(OP_STATUS, &(), STATUS_DEADLINE).await?;
        if op != OP_STATUS {
            return Err(GatewayError::Network(format!("unexpected RPC op {}", op)));
        }
        rpc::decode_body(&body)
    }

    /// One request/response exchange with a deadline. On an IO error the
    /// stream is dropped and the call retried once over a fresh dial.
    async fn call<T: bincode::Encode>(
        &self,
        op: u8,
        request: &T,
        deadline: Duration,
    ) -> Result<(u8, Vec<u8>)> {
        let mut guard = self.stream.lock().await;
        for attempt in 0..2 {
            let result = tokio::time::timeout(deadline, async {
                let stream = self.connected(&mut guard).await?;
                rpc::write_frame(stream, op, request).await?;
                rpc::read_frame(stream).await
            })
            .await;

            match result {
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(e)) => {
                    debug!(endpoint = %self.endpoint, attempt, "RPC call failed: {}", e);
                    *guard = None;
                    if attempt == 1 {
                        return Err(e);
                    }
                }
                Err(_) => {
                    *guard = None;
                    return Err(GatewayError::Timeout(format!(
                        "routing RPC to {}",
                        self.endpoint
                    )));
                }
            }
        }
        unreachable!("retry loop returns on second attempt");
    }

    /// Borrow the live stream, dialing if necessary.
    async fn connected<'a>(
        &self,
        guard: &'a mut Option<TcpStream>,
    ) -> Result<&'a mut TcpStream> {
        if guard.is_none() {
            let stream = TcpStream::connect(&self.endpoint).await.map_err(|e| {
                GatewayError::Network(format!(
                    "failed to reach routing service {}: {}",
                    self.endpoint, e
                ))
            })?;
            info!(endpoint = %self.endpoint, "connected to routing service");
            *guard = Some(stream);
        }
        Ok(guard.as_mut().expect("stream populated above"))
    }
}
