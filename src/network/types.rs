// Shared types for the connection layer

use crate::id::ConnectionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Wire protocol spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Tcp,
    WebSocket,
    Http,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Tcp => write!(f, "TCP"),
            ConnectionKind::WebSocket => write!(f, "WebSocket"),
            ConnectionKind::Http => write!(f, "HTTP"),
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
            ConnectionState::Error => write!(f, "Error"),
        }
    }
}

/// Registry-level connection events delivered to the event observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Removed,
    Error,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected => write!(f, "Connected"),
            ConnectionEvent::Disconnected => write!(f, "Disconnected"),
            ConnectionEvent::Removed => write!(f, "Removed"),
            ConnectionEvent::Error => write!(f, "Error"),
        }
    }
}

/// Per-connection traffic statistics.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connected_at: Instant,
    pub last_activity_at: Instant,
}

impl ConnectionStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            connected_at: now,
            last_activity_at: now,
        }
    }

    /// Advance the activity timestamp to now.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    pub fn record_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.touch();
    }

    pub fn record_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.touch();
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate statistics across the registry, refreshed by the cleanup task.
#[derive(Debug, Clone, Default)]
pub struct AggregateStats {
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
}

/// Observer invoked with each inbound byte chunk.
pub type MessageObserver = std::sync::Arc<dyn Fn(ConnectionId, &[u8]) + Send + Sync>;

/// Observer invoked on every state transition with (old, new).
pub type StateObserver =
    std::sync::Arc<dyn Fn(ConnectionId, ConnectionState, ConnectionState) + Send + Sync>;

/// Observer invoked exactly once when a connection finishes closing.
pub type CloseObserver = std::sync::Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// Observer invoked on registry-level connection events.
pub type EventObserver = std::sync::Arc<dyn Fn(ConnectionId, ConnectionEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_strings() {
        assert_eq!(ConnectionKind::Tcp.to_string(), "TCP");
        assert_eq!(ConnectionKind::WebSocket.to_string(), "WebSocket");
        assert_eq!(ConnectionState::Disconnecting.to_string(), "Disconnecting");
        assert_eq!(ConnectionEvent::Removed.to_string(), "Removed");
    }

    #[test]
    fn test_stats_touch_advances() {
        let mut stats = ConnectionStats::new();
        let before = stats.last_activity_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        stats.record_bytes_received(10);
        assert!(stats.last_activity_at > before);
        assert_eq!(stats.bytes_received, 10);
    }
}
