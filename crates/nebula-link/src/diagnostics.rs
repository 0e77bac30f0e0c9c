//! Link diagnostics: RTT measurement, jitter, and ping loss tracking.
//!
//! Samples come from heartbeat ping/pong pairs. Every method takes the
//! current [`Instant`] so the tracker stays deterministic under test.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct PendingPing {
    sequence: u32,
    sent_at: Instant,
}

/// Configuration for the diagnostics tracker.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Number of RTT samples to keep in the rolling window. Default: 100.
    pub window_size: usize,
    /// Age after which a pending ping counts as lost. Default: 10s.
    pub ping_timeout: Duration,
    /// Maximum outstanding pings remembered. Default: 64.
    pub max_pending: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            ping_timeout: Duration::from_secs(10),
            max_pending: 64,
        }
    }
}

/// Rolling window of RTT samples.
pub struct DiagnosticsTracker {
    config: DiagnosticsConfig,
    rtt_samples: VecDeque<Duration>,
    pending_pings: VecDeque<PendingPing>,
    next_sequence: u32,
    total_pings_sent: u64,
    total_pongs_received: u64,
}

impl Default for DiagnosticsTracker {
    fn default() -> Self {
        Self::new(DiagnosticsConfig::default())
    }
}

impl DiagnosticsTracker {
    /// Create a new tracker with the given configuration.
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            rtt_samples: VecDeque::with_capacity(config.window_size),
            pending_pings: VecDeque::new(),
            next_sequence: 0,
            total_pings_sent: 0,
            total_pongs_received: 0,
            config,
        }
    }

    /// Record that a ping was sent. Returns the sequence number to carry in
    /// the ping payload.
    pub fn on_ping_sent(&mut self, now: Instant) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        if self.pending_pings.len() >= self.config.max_pending {
            self.pending_pings.pop_front();
        }
        self.pending_pings.push_back(PendingPing {
            sequence: seq,
            sent_at: now,
        });
        self.total_pings_sent += 1;
        seq
    }

    /// Record a pong echoing `sequence`. Returns the RTT sample, or `None`
    /// for an unknown or expired sequence.
    pub fn on_pong_received(&mut self, sequence: u32, now: Instant) -> Option<Duration> {
        let pos = self
            .pending_pings
            .iter()
            .position(|p| p.sequence == sequence)?;
        let ping = self.pending_pings.remove(pos)?;
        let rtt = now.saturating_duration_since(ping.sent_at);

        if self.rtt_samples.len() >= self.config.window_size {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);
        self.total_pongs_received += 1;
        Some(rtt)
    }

    /// Drop pending pings older than the ping timeout.
    pub fn expire_pending(&mut self, now: Instant) {
        let timeout = self.config.ping_timeout;
        while let Some(front) = self.pending_pings.front() {
            if now.saturating_duration_since(front.sent_at) > timeout {
                self.pending_pings.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average RTT over the rolling window.
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let sum: Duration = self.rtt_samples.iter().sum();
        Some(sum / self.rtt_samples.len() as u32)
    }

    /// Jitter: sample standard deviation of the RTT window.
    pub fn jitter(&self) -> Option<Duration> {
        if self.rtt_samples.len() < 2 {
            return None;
        }

        let avg = self.average_rtt()?.as_secs_f64();
        let variance: f64 = self
            .rtt_samples
            .iter()
            .map(|s| {
                let diff = s.as_secs_f64() - avg;
                diff * diff
            })
            .sum::<f64>()
            / (self.rtt_samples.len() - 1) as f64;

        Some(Duration::from_secs_f64(variance.sqrt()))
    }

    /// Lost pings as a fraction of pings sent, excluding those still in flight.
    pub fn loss_rate(&self) -> f64 {
        if self.total_pings_sent == 0 {
            return 0.0;
        }
        let lost = self
            .total_pings_sent
            .saturating_sub(self.total_pongs_received)
            .saturating_sub(self.pending_pings.len() as u64);
        lost as f64 / self.total_pings_sent as f64
    }

    /// Immutable snapshot of the current figures.
    pub fn snapshot(&self) -> LinkDiagnostics {
        LinkDiagnostics {
            average_rtt: self.average_rtt(),
            min_rtt: self.rtt_samples.iter().min().copied(),
            max_rtt: self.rtt_samples.iter().max().copied(),
            jitter: self.jitter(),
            loss_rate: self.loss_rate(),
            sample_count: self.rtt_samples.len(),
        }
    }
}

/// Snapshot of link diagnostics, returned by `Client::diagnostics`.
#[derive(Debug, Clone, Default)]
pub struct LinkDiagnostics {
    /// Average round-trip time.
    pub average_rtt: Option<Duration>,
    /// Minimum round-trip time.
    pub min_rtt: Option<Duration>,
    /// Maximum round-trip time.
    pub max_rtt: Option<Duration>,
    /// Jitter (standard deviation of RTT).
    pub jitter: Option<Duration>,
    /// Ping loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// Number of RTT samples in the rolling window.
    pub sample_count: usize,
}
