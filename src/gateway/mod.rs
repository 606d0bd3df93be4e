// Gateway façade
//
// Composition root for the client-facing process: builds the identifier
// source, registry, dispatcher, protocol manager, HTTP routes, auth and
// the routing client, wires observers into the three acceptors, and owns
// startup and shutdown. Built-in handlers cover heartbeat, login, logout
// and chat forwarding; everything else is registered by the embedder.

pub mod auth;
pub mod routing_client;

pub use auth::{AuthManager, AuthSession};
pub use routing_client::RoutingClient;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::id::{ConnectionId, IdGenerator};
use crate::network::{
    Acceptor, Connection, ConnectionKind, ConnectionObservers, ConnectionRegistry, HttpResponse,
    HttpRouter, RegistryConfig,
};
use crate::protocol::message::{Message, MessageKind};
use crate::protocol::{tcp, websocket, MessageDispatcher, ProtocolManager};
use crate::routing::rpc::RouteRequest;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The gateway process: three acceptors, one registry, one dispatch table.
pub struct Gateway {
    config: GatewayConfig,
    ids: Arc<IdGenerator>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<MessageDispatcher>,
    protocol: Arc<ProtocolManager>,
    http_router: Arc<HttpRouter>,
    auth: Arc<AuthManager>,
    routing: Arc<RoutingClient>,
    acceptors: Mutex<Vec<Arc<Acceptor>>>,
    running: AtomicBool,
}

impl Gateway {
    /// Build the component graph from a validated config.
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let ids = Arc::new(IdGenerator::new());
        let registry = ConnectionRegistry::new(RegistryConfig {
            max_connections: config.max_connections,
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
            enable_statistics: true,
        });
        let dispatcher = Arc::new(MessageDispatcher::new());
        let protocol = Arc::new(ProtocolManager::new(
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            Arc::clone(&ids),
        ));
        let http_router = Arc::new(HttpRouter::new());
        http_router.set_cors_enabled(config.cors_enabled);
        let auth = Arc::new(AuthManager::new(
            config.auth_enabled,
            config.auth_secret.clone(),
            Duration::from_secs(config.auth_token_ttl_seconds),
        ));
        let routing = Arc::new(RoutingClient::new(config.routing_endpoint.clone()));

        Ok(Arc::new(Self {
            config,
            ids,
            registry,
            dispatcher,
            protocol,
            http_router,
            auth,
            routing,
            acceptors: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn http_router(&self) -> &Arc<HttpRouter> {
        &self.http_router
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn routing(&self) -> &Arc<RoutingClient> {
        &self.routing
    }

    fn acceptor_addr(&self, kind: ConnectionKind) -> Option<SocketAddr> {
        self.acceptors
            .lock()
            .iter()
            .find(|a| a.kind() == kind)
            .and_then(|a| a.local_addr())
    }

    /// Bound framed-TCP address, once started.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.acceptor_addr(ConnectionKind::Tcp)
    }

    /// Bound WebSocket address, once started.
    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        self.acceptor_addr(ConnectionKind::WebSocket)
    }

    /// Bound HTTP address, once started.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.acceptor_addr(ConnectionKind::Http)
    }

    /// Send raw bytes to a connection by id.
    pub fn send_message(&self, connection_id: ConnectionId, data: Vec<u8>) -> Result<()> {
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| GatewayError::NotFound(format!("connection {}", connection_id)))?;
        connection.send(data)
    }

    /// Wire observers, register built-in handlers, bind and start the
    /// three acceptors, start the cleanup timer.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.register_builtin_handlers();
        self.register_builtin_routes();

        let observers = {
            let protocol = Arc::clone(&self.protocol);
            let registry = Arc::clone(&self.registry);
            let cleanup_protocol = Arc::clone(&self.protocol);
            let auth = Arc::clone(&self.auth);
            ConnectionObservers {
                on_message: Arc::new(move |id, data| protocol.process(id, data)),
                on_state_change: Arc::new(|id, old_state, new_state| {
                    debug!(connection_id = id, %old_state, %new_state, "connection state changed");
                }),
                on_close: Arc::new(move |id| {
                    registry.remove(id);
                    cleanup_protocol.remove(id);
                    auth.detach_connection(id);
                }),
            }
        };

        let endpoints = [
            (ConnectionKind::Tcp, self.config.tcp_port),
            (ConnectionKind::WebSocket, self.config.websocket_port),
            (ConnectionKind::Http, self.config.http_port),
        ];
        for (kind, port) in endpoints {
            let acceptor = Acceptor::new(
                kind,
                Arc::clone(&self.ids),
                Arc::clone(&self.registry),
                observers.clone(),
            );
            acceptor.bind(port).await?;
            acceptor.start()?;
            self.acceptors.lock().push(acceptor);
        }

        self.registry.start_cleanup();
        info!(
            tcp_port = self.config.tcp_port,
            websocket_port = self.config.websocket_port,
            http_port = self.config.http_port,
            max_connections = self.config.max_connections,
            "gateway started"
        );
        Ok(())
    }

    /// Stop acceptors, close every connection, stop the cleanup timer.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for acceptor in self.acceptors.lock().drain(..) {
            acceptor.stop();
        }
        self.registry.stop_cleanup();
        self.registry.close_all();
        info!("gateway stopped");
    }

    // ------------------------------------------------------------------
    // Built-in behavior
    // ------------------------------------------------------------------

    fn register_builtin_handlers(self: &Arc<Self>) {
        // Heartbeat: answer on the same connection.
        self.dispatcher.register(
            MessageKind::HeartbeatRequest,
            Arc::new(|message, connection| {
                reply(
                    connection,
                    MessageKind::HeartbeatResponse,
                    app_payload(message, connection),
                )
            }),
        );

        // Login: issue a token, bind the session to the connection.
        let auth = Arc::clone(&self.auth);
        self.dispatcher.register(
            MessageKind::LoginRequest,
            Arc::new(move |message, connection| {
                let user_id = String::from_utf8_lossy(app_payload(message, connection))
                    .trim()
                    .to_string();
                if user_id.is_empty() {
                    return reply(
                        connection,
                        MessageKind::ErrorResponse,
                        b"login requires a user id",
                    );
                }
                if !auth.is_enabled() {
                    connection.set_context("user_id", user_id);
                    return reply(connection, MessageKind::LoginResponse, b"ok");
                }
                match auth.issue(&user_id, connection.id()) {
                    Ok(token) => {
                        connection.set_context("user_id", user_id);
                        connection.set_context("token", token.clone());
                        reply(connection, MessageKind::LoginResponse, token.as_bytes())
                    }
                    Err(e) => {
                        warn!(connection_id = connection.id(), "login failed: {}", e);
                        reply(connection, MessageKind::ErrorResponse, e.to_string().as_bytes())
                    }
                }
            }),
        );

        // Logout: revoke the token, detach the session.
        let auth = Arc::clone(&self.auth);
        self.dispatcher.register(
            MessageKind::LogoutRequest,
            Arc::new(move |message, connection| {
                let token = String::from_utf8_lossy(app_payload(message, connection)).to_string();
                if !token.is_empty() {
                    auth.revoke(token.trim());
                }
                connection.remove_context("user_id");
                connection.remove_context("token");
                reply(connection, MessageKind::LogoutResponse, b"")
            }),
        );

        // Chat: forward to the routing service; acknowledge or report.
        let chat_handler = self.chat_handler();
        self.dispatcher.register(MessageKind::ChatRequest, chat_handler.clone());
        self.dispatcher.register(MessageKind::GroupChatRequest, chat_handler);

        // Fallback: HTTP goes to the route table, WebSocket data frames
        // echo, framed TCP without a handler is dropped.
        let http_router = Arc::clone(&self.http_router);
        self.dispatcher.set_fallback(Arc::new(move |message, connection| {
            match connection.kind() {
                ConnectionKind::Http => {
                    http_router.dispatch(message, connection);
                    Ok(())
                }
                ConnectionKind::WebSocket => {
                    let frame = message.serialize()?;
                    connection.send(frame)
                }
                ConnectionKind::Tcp => {
                    warn!(
                        message_key = message.key(),
                        kind = %message.kind(),
                        "unhandled message dropped"
                    );
                    Ok(())
                }
            }
        }));
    }

    /// Handler forwarding chat traffic to the routing service.
    fn chat_handler(self: &Arc<Self>) -> crate::protocol::MessageHandler {
        let routing = Arc::clone(&self.routing);
        Arc::new(move |message, connection| {
            let request = RouteRequest::new(message.message_id().to_string(), "chat")
                .with_payload(app_payload(message, connection).to_vec())
                .with_priority(if message.kind() == MessageKind::GroupChatRequest {
                    1
                } else {
                    0
                });
            let routing = Arc::clone(&routing);
            let connection = Arc::clone(connection);
            tokio::spawn(async move {
                let result = routing.route_message(&request).await;
                let outcome = match result {
                    Ok(response) if response.accepted => {
                        reply(&connection, MessageKind::MessageAck, request.message_id.as_bytes())
                    }
                    Ok(response) => reply(
                        &connection,
                        MessageKind::ErrorResponse,
                        response.error_message.as_bytes(),
                    ),
                    Err(e) => {
                        warn!(
                            connection_id = connection.id(),
                            "chat forwarding failed: {}", e
                        );
                        reply(
                            &connection,
                            MessageKind::ErrorResponse,
                            b"routing service unavailable",
                        )
                    }
                };
                if let Err(e) = outcome {
                    debug!(connection_id = connection.id(), "reply failed: {}", e);
                }
            });
            Ok(())
        })
    }

    fn register_builtin_routes(&self) {
        let registry = Arc::clone(&self.registry);
        self.http_router.register(
            "GET",
            "/status",
            Arc::new(move |_| {
                Ok(HttpResponse::json(&serde_json::json!({
                    "ok": true,
                    "connections": registry.connection_count(),
                    "tcp": registry.connection_count_by_kind(ConnectionKind::Tcp),
                    "websocket": registry.connection_count_by_kind(ConnectionKind::WebSocket),
                    "http": registry.connection_count_by_kind(ConnectionKind::Http),
                })))
            }),
        );
    }
}

/// Application payload of a message: WebSocket data frames carry the
/// two-byte kind prefix, which handlers never want to see.
fn app_payload<'a>(message: &'a Message, connection: &Arc<Connection>) -> &'a [u8] {
    let payload = message.payload();
    if connection.kind() == ConnectionKind::WebSocket
        && message.kind().is_recognized()
        && payload.len() >= 2
    {
        &payload[2..]
    } else {
        payload
    }
}

/// Answer on the same connection in its own framing. HTTP connections
/// answer through the route table instead, so this is a no-op for them.
fn reply(connection: &Arc<Connection>, kind: MessageKind, payload: &[u8]) -> Result<()> {
    match connection.kind() {
        ConnectionKind::Tcp => connection.send(tcp::encode_frame(kind.code(), payload)),
        ConnectionKind::WebSocket => {
            let mut framed = Vec::with_capacity(2 + payload.len());
            framed.extend_from_slice(&kind.code().to_be_bytes());
            framed.extend_from_slice(payload);
            connection.send(websocket::encode_frame(
                websocket::opcode::BINARY,
                true,
                &framed,
            ))
        }
        ConnectionKind::Http => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TcpParser;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            tcp_port: 0,
            websocket_port: 0,
            http_port: 0,
            auth_secret: "test_secret".to_string(),
            ..GatewayConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_binds_three_listeners() {
        let gateway = Gateway::new(test_config()).unwrap();
        gateway.start().await.unwrap();

        assert!(gateway.tcp_addr().is_some());
        assert!(gateway.websocket_addr().is_some());
        assert!(gateway.http_addr().is_some());
        gateway.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_round_trip() {
        let gateway = Gateway::new(test_config()).unwrap();
        gateway.start().await.unwrap();

        let mut client = TcpStream::connect(gateway.tcp_addr().unwrap()).await.unwrap();
        client
            .write_all(&tcp::encode_frame(
                MessageKind::HeartbeatRequest.code(),
                b"",
            ))
            .await
            .unwrap();

        let mut parser = TcpParser::new(0, Arc::new(IdGenerator::new()));
        let response = loop {
            let mut buf = [0u8; 256];
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed without heartbeat response");
            let mut messages = parser.feed(&buf[..n]).unwrap();
            if !messages.is_empty() {
                break messages.remove(0);
            }
        };
        assert_eq!(response.kind(), MessageKind::HeartbeatResponse);
        gateway.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_login_issues_token() {
        let gateway = Gateway::new(test_config()).unwrap();
        gateway.start().await.unwrap();

        let mut client = TcpStream::connect(gateway.tcp_addr().unwrap()).await.unwrap();
        client
            .write_all(&tcp::encode_frame(MessageKind::LoginRequest.code(), b"alice"))
            .await
            .unwrap();

        let mut parser = TcpParser::new(0, Arc::new(IdGenerator::new()));
        let response = loop {
            let mut buf = [0u8; 1024];
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            let mut messages = parser.feed(&buf[..n]).unwrap();
            if !messages.is_empty() {
                break messages.remove(0);
            }
        };
        assert_eq!(response.kind(), MessageKind::LoginResponse);

        let token = String::from_utf8(response.payload().to_vec()).unwrap();
        let session = gateway.auth().validate(&token).unwrap();
        assert_eq!(session.user_id, "alice");
        gateway.stop();
    }
}
