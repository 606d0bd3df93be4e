// In-gateway message dispatch
//
// A table from application message code to handler. Handlers are
// side-effecting: they may answer on the connection, forward to the
// routing service, or update local session state. A handler error is
// caught here; the message is logged and dropped.

use crate::error::Result;
use crate::network::Connection;
use crate::protocol::message::{Message, MessageKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

/// Handler invoked for one message kind.
pub type MessageHandler = Arc<dyn Fn(&Message, &Arc<Connection>) -> Result<()> + Send + Sync>;

/// Dispatch table keyed by message kind.
pub struct MessageDispatcher {
    handlers: RwLock<HashMap<u16, MessageHandler>>,
    fallback: RwLock<Option<MessageHandler>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    /// Register the handler for one message kind, replacing any previous
    /// registration.
    pub fn register(&self, kind: MessageKind, handler: MessageHandler) {
        self.handlers.write().insert(kind.code(), handler);
    }

    pub fn unregister(&self, kind: MessageKind) {
        self.handlers.write().remove(&kind.code());
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers.read().contains_key(&kind.code())
    }

    /// Install the handler that receives messages no table entry matches.
    pub fn set_fallback(&self, handler: MessageHandler) {
        *self.fallback.write() = Some(handler);
    }

    /// Route one message to its handler. Missing handlers log and drop;
    /// handler errors are caught at this boundary.
    pub fn route(&self, message: &Message, connection: &Arc<Connection>) {
        let handler = {
            let handlers = self.handlers.read();
            handlers.get(&message.kind().code()).cloned()
        };
        let handler = match handler {
            Some(handler) => Some(handler),
            None => self.fallback.read().clone(),
        };

        let Some(handler) = handler else {
            warn!(
                message_key = message.key(),
                kind = %message.kind(),
                "no handler registered, dropping message"
            );
            return;
        };

        if let Err(e) = handler(message, connection) {
            error!(
                message_key = message.key(),
                kind = %message.kind(),
                "handler failed: {}",
                e
            );
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::network::ConnectionKind;
    use crate::protocol::message::MessageDetail;
    use crate::protocol::tcp::TcpFrameHeader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    async fn test_connection() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(1, ConnectionKind::Tcp, peer, server), client)
    }

    fn test_message(kind: MessageKind) -> Message {
        Message::new(
            1,
            1,
            ConnectionKind::Tcp,
            kind,
            Vec::new(),
            MessageDetail::Tcp(TcpFrameHeader::for_payload(kind.code(), 0)),
        )
    }

    #[tokio::test]
    async fn test_routes_to_registered_handler() {
        let dispatcher = MessageDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        dispatcher.register(
            MessageKind::ChatRequest,
            Arc::new(move |_, _| {
                calls_in_handler.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let (conn, _client) = test_connection().await;
        dispatcher.route(&test_message(MessageKind::ChatRequest), &conn);
        dispatcher.route(&test_message(MessageKind::HeartbeatRequest), &conn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_receives_unmatched() {
        let dispatcher = MessageDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        dispatcher.set_fallback(Arc::new(move |_, _| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let (conn, _client) = test_connection().await;
        dispatcher.route(&test_message(MessageKind::Unrecognized(777)), &conn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let dispatcher = MessageDispatcher::new();
        dispatcher.register(
            MessageKind::ChatRequest,
            Arc::new(|_, _| Err(GatewayError::Internal("boom".to_string()))),
        );

        let (conn, _client) = test_connection().await;
        // Must not panic or propagate.
        dispatcher.route(&test_message(MessageKind::ChatRequest), &conn);
    }

    #[tokio::test]
    async fn test_unregister() {
        let dispatcher = MessageDispatcher::new();
        dispatcher.register(MessageKind::ChatRequest, Arc::new(|_, _| Ok(())));
        assert!(dispatcher.has_handler(MessageKind::ChatRequest));
        dispatcher.unregister(MessageKind::ChatRequest);
        assert!(!dispatcher.has_handler(MessageKind::ChatRequest));
    }
}
