//! Per-attempt traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters bumped by a channel's receive and send loops.
///
/// Atomics let the loops record traffic without locking.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl TrafficCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one physical write carrying `messages` messages.
    pub fn record_send(&self, wire_bytes: usize, messages: usize) {
        self.bytes_sent.fetch_add(wire_bytes as u64, Ordering::Relaxed);
        self.messages_sent
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    /// Record one physical read carrying `messages` messages.
    pub fn record_receive(&self, wire_bytes: usize, messages: usize) {
        self.bytes_received
            .fetch_add(wire_bytes as u64, Ordering::Relaxed);
        self.messages_received
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`TrafficCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Wire bytes sent (post-compression, including framing).
    pub bytes_sent: u64,
    /// Wire bytes received.
    pub bytes_received: u64,
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
}
