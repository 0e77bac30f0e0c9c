//! Liveness monitoring for an authenticated session.
//!
//! Channels record traffic in a shared [`Activity`]. The
//! [`HeartbeatMonitor`] watches it: it sends periodic application pings when
//! the channel has no native liveness, and after every outbound queue drain
//! it expects inbound traffic within a probe window. When none arrives it
//! pings explicitly, and a missing pong declares the channel dead.
//!
//! The monitor runs under the attempt's cancellation token and reports a dead
//! channel at most once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Heartbeat tuning.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Periodic ping interval for channels without native liveness. Default: 30 s.
    pub interval: Duration,
    /// Wait for inbound traffic after a queue drain before pinging. Default: 5 s.
    pub probe_timeout: Duration,
    /// Wait for a pong after an explicit ping. Default: 5 s.
    pub pong_timeout: Duration,
    /// Message type of application pings. Default: `"sys.ping"`.
    pub ping_type: String,
    /// Message type of application pongs. Default: `"sys.pong"`.
    pub pong_type: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(5),
            ping_type: "sys.ping".to_string(),
            pong_type: "sys.pong".to_string(),
        }
    }
}

/// One outbound queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drain {
    /// Monotonic drain counter.
    pub seq: u64,
    /// Inbound count observed before the write that emptied the queue.
    pub inbound_before: u64,
}

/// Traffic signals for one connection attempt.
#[derive(Debug)]
pub struct Activity {
    inbound: watch::Sender<u64>,
    pongs: watch::Sender<u64>,
    drained: watch::Sender<Drain>,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    /// Create zeroed signals.
    pub fn new() -> Self {
        Self {
            inbound: watch::Sender::new(0),
            pongs: watch::Sender::new(0),
            drained: watch::Sender::new(Drain::default()),
        }
    }

    /// Record inbound bytes of any kind.
    pub fn touch_inbound(&self) {
        self.inbound.send_modify(|c| *c += 1);
    }

    /// Inbound events so far.
    pub fn inbound_count(&self) -> u64 {
        *self.inbound.borrow()
    }

    /// Record a received pong.
    pub fn mark_pong(&self) {
        self.pongs.send_modify(|c| *c += 1);
    }

    /// Pongs so far.
    pub fn pong_count(&self) -> u64 {
        *self.pongs.borrow()
    }

    /// Record that the outbound queue emptied after a write that started
    /// when the inbound count was `inbound_before`.
    pub fn mark_drained(&self, inbound_before: u64) {
        self.drained.send_modify(|d| {
            d.seq += 1;
            d.inbound_before = inbound_before;
        });
    }

    fn subscribe_inbound(&self) -> watch::Receiver<u64> {
        self.inbound.subscribe()
    }

    fn subscribe_pongs(&self) -> watch::Receiver<u64> {
        self.pongs.subscribe()
    }

    pub(crate) fn subscribe_drained(&self) -> watch::Receiver<Drain> {
        self.drained.subscribe()
    }
}

/// Where the monitor sends pings and reports death.
pub trait PingSink: Send + Sync {
    /// Enqueue one application ping on the current channel.
    fn send_ping(&self) -> Result<(), EngineError>;

    /// Ask the orchestrator to abandon this channel.
    fn report_dead(&self);
}

/// Watches one attempt's [`Activity`].
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    activity: Arc<Activity>,
    native_liveness: bool,
    sink: Arc<dyn PingSink>,
    cancel: CancellationToken,
    drained: watch::Receiver<Drain>,
}

impl HeartbeatMonitor {
    /// Create a monitor. `cancel` is the attempt scope.
    pub fn new(
        config: HeartbeatConfig,
        activity: Arc<Activity>,
        native_liveness: bool,
        sink: Arc<dyn PingSink>,
        cancel: CancellationToken,
    ) -> Self {
        // Drains from here on count, even before the task first runs.
        let drained = activity.subscribe_drained();
        Self {
            config,
            activity,
            native_liveness,
            sink,
            cancel,
            drained,
        }
    }

    /// Spawn the monitor loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled or until the channel is declared dead.
    pub async fn run(self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::trace!("Heartbeat monitor cancelled");
            }
            _ = self.monitor() => {}
        }
    }

    async fn monitor(&self) {
        let mut drained = self.drained.clone();

        let periodic = !self.native_liveness && !self.config.interval.is_zero();
        // interval_at panics on a zero period; the branch is disabled then anyway.
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        // A long probe must not leave a burst of periodic pings behind it.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick(), if periodic => {
                    if let Err(e) = self.sink.send_ping() {
                        tracing::debug!("Periodic ping not sent: {e}");
                    }
                }
                changed = drained.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let baseline = drained.borrow_and_update().inbound_before;
                    if !self.probe(baseline).await {
                        tracing::warn!(
                            "No pong within {:?}, declaring channel dead",
                            self.config.pong_timeout
                        );
                        self.sink.report_dead();
                        return;
                    }
                    // Drains caused by our own probe ping are not new sends.
                    drained.borrow_and_update();
                }
            }
        }
    }

    /// Returns `false` when the channel should be declared dead.
    async fn probe(&self, baseline: u64) -> bool {
        let mut inbound = self.activity.subscribe_inbound();
        let heard = matches!(
            timeout(
                self.config.probe_timeout,
                inbound.wait_for(|count| *count > baseline),
            )
            .await,
            Ok(Ok(_))
        );
        if heard {
            return true;
        }

        let pong_baseline = self.activity.pong_count();
        let mut pongs = self.activity.subscribe_pongs();
        tracing::debug!(
            "No inbound traffic within {:?} of a send, probing with ping",
            self.config.probe_timeout
        );
        if let Err(e) = self.sink.send_ping() {
            tracing::debug!("Probe ping not sent: {e}");
            return false;
        }

        matches!(
            timeout(
                self.config.pong_timeout,
                pongs.wait_for(|count| *count > pong_baseline),
            )
            .await,
            Ok(Ok(_))
        )
    }
}
