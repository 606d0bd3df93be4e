// Wire protocol layer: the uniform message abstraction, the per-protocol
// incremental parsers, and the pieces that tie inbound bytes to handlers

pub mod dispatcher;
pub mod http;
pub mod manager;
pub mod message;
pub mod tcp;
pub mod websocket;

pub use dispatcher::{MessageDispatcher, MessageHandler};
pub use http::HttpParser;
pub use manager::ProtocolManager;
pub use message::{Message, MessageDetail, MessageKind};
pub use tcp::{TcpFrameHeader, TcpParser};
pub use websocket::{compute_accept_key, opcode, WebSocketParser};

/// Upper bound on a single parsed message, enforced by every parser.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
