// Process-wide identifier source
//
// Allocates monotonic ids per kind from independent atomic counters and
// provides UUID / short-id helpers for string-keyed contexts. Constructed
// once by the composition root and passed around explicitly.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Unique identifier of a live connection within this process.
pub type ConnectionId = u64;

/// Unique identifier of a parsed message within this process.
pub type MessageId = u64;

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Snapshot of the generator counters.
#[derive(Debug, Clone)]
pub struct GeneratorStats {
    pub next_connection_id: u64,
    pub next_message_id: u64,
    pub next_session_id: u64,
    pub next_user_id: u64,
    pub total_generated: u64,
}

/// Monotonic per-kind id allocator.
pub struct IdGenerator {
    next_connection_id: AtomicU64,
    next_message_id: AtomicU64,
    next_session_id: AtomicU64,
    next_user_id: AtomicU64,
    total_generated: AtomicU64,
    started_at: Instant,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next_connection_id: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
            next_user_id: AtomicU64::new(1),
            total_generated: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Allocate the next connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.total_generated.fetch_add(1, Ordering::Relaxed);
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate the next message id.
    pub fn next_message_id(&self) -> MessageId {
        self.total_generated.fetch_add(1, Ordering::Relaxed);
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate the next session id.
    pub fn next_session_id(&self) -> u64 {
        self.total_generated.fetch_add(1, Ordering::Relaxed);
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate the next user id.
    pub fn next_user_id(&self) -> u64 {
        self.total_generated.fetch_add(1, Ordering::Relaxed);
        self.next_user_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Generate a random UUID v4 string.
    pub fn uuid(&self) -> String {
        self.total_generated.fetch_add(1, Ordering::Relaxed);
        uuid::Uuid::new_v4().to_string()
    }

    /// Generate a Base62 short id of the given length.
    pub fn short_id(&self, length: usize) -> String {
        self.total_generated.fetch_add(1, Ordering::Relaxed);
        let mut rng = rand::rng();
        (0..length)
            .map(|_| BASE62_CHARS[rng.random_range(0..BASE62_CHARS.len())] as char)
            .collect()
    }

    /// Seconds since the generator was constructed.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> GeneratorStats {
        GeneratorStats {
            next_connection_id: self.next_connection_id.load(Ordering::Relaxed),
            next_message_id: self.next_message_id.load(Ordering::Relaxed),
            next_session_id: self.next_session_id.load(Ordering::Relaxed),
            next_user_id: self.next_user_id.load(Ordering::Relaxed),
            total_generated: self.total_generated.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter back to 1. Intended for tests.
    pub fn reset(&self) {
        self.next_connection_id.store(1, Ordering::Relaxed);
        self.next_message_id.store(1, Ordering::Relaxed);
        self.next_session_id.store(1, Ordering::Relaxed);
        self.next_user_id.store(1, Ordering::Relaxed);
        self.total_generated.store(0, Ordering::Relaxed);
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
