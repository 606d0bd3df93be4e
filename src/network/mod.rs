// Connection layer: session objects, the live-connection registry, and the
// per-protocol acceptors
//
// Connections are owned by the registry and addressed by id everywhere
// else; parsers, handlers and acceptors hold ids and resolve them through
// the registry at call time.

pub mod acceptor;
pub mod connection;
pub mod http_server;
pub mod registry;
pub mod types;

pub use acceptor::{Acceptor, ConnectionObservers};
pub use connection::Connection;
pub use http_server::{HttpResponse, HttpRouter};
pub use registry::{ConnectionRegistry, RegistryConfig};
pub use types::{
    AggregateStats, CloseObserver, ConnectionEvent, ConnectionKind, ConnectionState,
    ConnectionStats, EventObserver, MessageObserver, StateObserver,
};

pub use crate::id::ConnectionId;
