// Protocol manager: per-connection parser cache
//
// Owns one parser per live connection, keyed by id and created from the
// connection's kind on first use. Inbound bytes flow through here to the
// dispatcher; WebSocket control frames are answered on the connection
// without reaching handlers. A framing error closes the source connection
// and discards its parser.

use crate::error::Result;
use crate::id::{ConnectionId, IdGenerator};
use crate::network::{ConnectionKind, ConnectionRegistry};
use crate::protocol::dispatcher::MessageDispatcher;
use crate::protocol::http::HttpParser;
use crate::protocol::message::Message;
use crate::protocol::tcp::TcpParser;
use crate::protocol::websocket::{self, WebSocketParser};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Parser for one connection, selected by its kind.
enum ProtocolParser {
    Tcp(TcpParser),
    WebSocket(WebSocketParser),
    Http(HttpParser),
}

impl ProtocolParser {
    fn for_kind(kind: ConnectionKind, id: ConnectionId, ids: Arc<IdGenerator>) -> Self {
        match kind {
            ConnectionKind::Tcp => ProtocolParser::Tcp(TcpParser::new(id, ids)),
            ConnectionKind::WebSocket => ProtocolParser::WebSocket(WebSocketParser::new(id, ids)),
            ConnectionKind::Http => ProtocolParser::Http(HttpParser::new(id, ids)),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        match self {
            ProtocolParser::Tcp(parser) => parser.feed(data),
            ProtocolParser::WebSocket(parser) => parser.feed(data),
            ProtocolParser::Http(parser) => parser.feed(data),
        }
    }
}

/// Ties raw connection bytes to the message dispatcher.
pub struct ProtocolManager {
    parsers: DashMap<ConnectionId, ProtocolParser>,
    dispatcher: Arc<MessageDispatcher>,
    registry: Arc<ConnectionRegistry>,
    ids: Arc<IdGenerator>,
}

impl ProtocolManager {
    pub fn new(
        dispatcher: Arc<MessageDispatcher>,
        registry: Arc<ConnectionRegistry>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            parsers: DashMap::new(),
            dispatcher,
            registry,
            ids,
        }
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Feed one inbound chunk from a connection through its parser and
    /// dispatch every completed message. On a framing error the connection
    /// is closed and its parser dropped.
    pub fn process(&self, connection_id: ConnectionId, data: &[u8]) {
        let Some(connection) = self.registry.get(connection_id) else {
            debug!(connection_id, "bytes from unregistered connection dropped");
            return;
        };

        let parsed = {
            let mut entry = self.parsers.entry(connection_id).or_insert_with(|| {
                ProtocolParser::for_kind(connection.kind(), connection_id, Arc::clone(&self.ids))
            });
            entry.feed(data)
        };

        let messages = match parsed {
            Ok(messages) => messages,
            Err(e) => {
                warn!(connection_id, "framing error, closing connection: {}", e);
                self.parsers.remove(&connection_id);
                connection.close();
                return;
            }
        };

        for message in messages {
            connection.record_message_received();
            if connection.kind() == ConnectionKind::WebSocket {
                if self.handle_ws_control(&message, &connection) {
                    continue;
                }
            }
            self.dispatcher.route(&message, &connection);
        }
    }

    /// Answer WebSocket control frames in place. Returns true when the
    /// frame was consumed.
    fn handle_ws_control(
        &self,
        message: &Message,
        connection: &Arc<crate::network::Connection>,
    ) -> bool {
        match message.ws_opcode() {
            Some(websocket::opcode::PING) => {
                let pong =
                    websocket::encode_frame(websocket::opcode::PONG, true, message.payload());
                if let Err(e) = connection.send(pong) {
                    debug!(connection_id = connection.id(), "pong failed: {}", e);
                }
                true
            }
            Some(websocket::opcode::PONG) => true,
            Some(websocket::opcode::CLOSE) => {
                let reply =
                    websocket::encode_frame(websocket::opcode::CLOSE, true, message.payload());
                let _ = connection.send(reply);
                connection.close();
                true
            }
            _ => false,
        }
    }

    /// Drop the parser of a closed connection.
    pub fn remove(&self, connection_id: ConnectionId) {
        self.parsers.remove(&connection_id);
    }

    pub fn parser_count(&self) -> usize {
        self.parsers.len()
    }
}
