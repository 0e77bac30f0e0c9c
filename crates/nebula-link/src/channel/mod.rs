//! Transport channels: one physical connection attempt each.
//!
//! A [`Channel`] is a tagged enum over the three channel kinds. Every variant
//! exposes the same method set and reports lifecycle through an
//! [`EventSink`] bound to one [`AttemptId`], so the orchestrator can discard
//! notifications from attempts it has already abandoned.
//!
//! Each channel owns one bounded outbound queue drained by exactly one send
//! loop, so at most one physical write is in flight per channel and messages
//! reach the wire in enqueue order.

pub mod arq;
pub mod datagram;
pub mod poll;
pub mod socket;

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::WireCodec;
use crate::error::EngineError;
use crate::heartbeat::Activity;
use crate::platform::SocketConfig;
use crate::stats::TrafficCounters;

pub use arq::ArqConfig;
pub use datagram::DatagramChannel;
pub use poll::PollChannel;
pub use socket::SocketChannel;

/// Identifies one connection attempt. Strictly increasing per orchestrator.
pub type AttemptId = u64;

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Interchangeable transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Reliable pseudo-connection over UDP.
    Datagram,
    /// Persistent framed TCP connection.
    Socket,
    /// HTTP request/response polling.
    Poll,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelKind::Datagram => "datagram",
            ChannelKind::Socket => "socket",
            ChannelKind::Poll => "poll",
        })
    }
}

/// One concrete address a channel kind can connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Channel kind this endpoint belongs to.
    pub kind: ChannelKind,
    /// Host name, IP address, or (poll only) a full `http://` URL.
    pub address: String,
    /// Port, if not implied by the address.
    pub port: Option<u16>,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(kind: ChannelKind, address: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            kind,
            address: address.into(),
            port,
        }
    }

    /// Whether the address is non-blank. Blank addresses are a
    /// misconfiguration and are never connected to.
    pub fn is_usable(&self) -> bool {
        !self.address.trim().is_empty()
    }

    /// `host:port` for socket-style resolution.
    pub fn host_port(&self) -> Result<String, TransportError> {
        if !self.is_usable() {
            return Err(TransportError::InvalidEndpoint(self.to_string()));
        }
        let port = self
            .port
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{self} has no port")))?;
        let host = self.address.trim();
        if host.contains(':') && !host.starts_with('[') {
            Ok(format!("[{host}]:{port}"))
        } else {
            Ok(format!("{host}:{port}"))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.kind, self.address, port),
            None => write!(f, "{}://{}", self.kind, self.address),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

/// Connection-level failures. Handled by the orchestrator, never shown to
/// request callers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint cannot be connected to as configured.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// DNS resolution failed or returned nothing.
    #[error("failed to resolve {address}: {reason}")]
    Resolve {
        /// The address being resolved.
        address: String,
        /// Resolver error text.
        reason: String,
    },
    /// The connection was refused or reset during setup.
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    /// A connect, handshake, or liveness deadline passed.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The handshake exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// An HTTP poll failed.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// An I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed the connection.
    #[error("closed by peer")]
    Closed,
}

/// Why a channel stopped.
#[derive(Debug)]
pub enum CloseReason {
    /// `disconnect()` was called or the attempt scope was cancelled.
    Local,
    /// The attempt failed or the connection broke.
    Failed(TransportError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl From<TransportError> for CloseReason {
    fn from(e: TransportError) -> Self {
        CloseReason::Failed(e)
    }
}

/// Timings captured when a channel opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenInfo {
    /// Time from `connect()` to a usable transport.
    pub connect_latency: Duration,
    /// Time spent in the handshake exchange, for channels that have one.
    pub handshake_latency: Option<Duration>,
}

/// One lifecycle notification.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel is usable.
    Opened(OpenInfo),
    /// One serialized message payload arrived.
    Data(Vec<u8>),
    /// The channel stopped. Sent at most once.
    Closed(CloseReason),
}

/// A [`ChannelEvent`] tagged with the attempt that produced it.
#[derive(Debug)]
pub struct ChannelNotice {
    /// Originating attempt.
    pub attempt: AttemptId,
    /// What happened.
    pub event: ChannelEvent,
}

/// Delivers one attempt's notifications to the orchestrator.
///
/// Cloned into every loop of the attempt. `Opened` and `Data` are suppressed
/// once `Closed` has been sent, and `Closed` is sent at most once.
#[derive(Debug, Clone)]
pub struct EventSink {
    attempt: AttemptId,
    tx: mpsc::Sender<ChannelNotice>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    /// Bind a sink to `attempt`.
    pub fn new(attempt: AttemptId, tx: mpsc::Sender<ChannelNotice>) -> Self {
        Self {
            attempt,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attempt this sink reports for.
    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Report that the channel is usable.
    pub async fn opened(&self, info: OpenInfo) {
        self.emit(ChannelEvent::Opened(info)).await;
    }

    /// Report one inbound payload.
    pub async fn data(&self, payload: Vec<u8>) {
        self.emit(ChannelEvent::Data(payload)).await;
    }

    /// Report closure. Only the first call has any effect.
    pub async fn closed(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .tx
            .send(ChannelNotice {
                attempt: self.attempt,
                event: ChannelEvent::Closed(reason),
            })
            .await;
    }

    /// Whether `closed` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn emit(&self, event: ChannelEvent) {
        if self.is_closed() {
            return;
        }
        let _ = self
            .tx
            .send(ChannelNotice {
                attempt: self.attempt,
                event,
            })
            .await;
    }
}

// ---------------------------------------------------------------------------
// Settings and context
// ---------------------------------------------------------------------------

/// Datagram channel tuning.
#[derive(Debug, Clone)]
pub struct DatagramSettings {
    /// ARQ parameters.
    pub arq: ArqConfig,
    /// Retransmission and keepalive tick. Default: 20 ms.
    pub tick: Duration,
    /// Interval between keepalive heartbeat frames. Default: 1 s.
    pub heartbeat_interval: Duration,
    /// Close after this long without any inbound packet. Default: 15 s.
    pub idle_timeout: Duration,
}

impl Default for DatagramSettings {
    fn default() -> Self {
        Self {
            arq: ArqConfig::default(),
            tick: Duration::from_millis(20),
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(15),
        }
    }
}

/// Settings shared by every channel kind.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Deadline for establishing the transport. Default: 10 s.
    pub connect_timeout: Duration,
    /// Deadline for the datagram handshake. Default: 10 s.
    pub handshake_timeout: Duration,
    /// Outbound queue capacity in messages. Default: 256.
    pub send_queue_capacity: usize,
    /// Most messages coalesced into one write. Default: 32.
    pub max_batch: usize,
    /// Idle poll interval; zero disables idle polling. Default: 5 s.
    pub poll_interval: Duration,
    /// TCP options for the socket channel.
    pub socket: SocketConfig,
    /// Datagram channel tuning.
    pub datagram: DatagramSettings,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            send_queue_capacity: 256,
            max_batch: 32,
            poll_interval: Duration::from_secs(5),
            socket: SocketConfig::default(),
            datagram: DatagramSettings::default(),
        }
    }
}

/// Everything an attempt's loops share.
#[derive(Clone)]
pub struct ChannelContext {
    /// Lifecycle notifications.
    pub sink: EventSink,
    /// Traffic signals for the heartbeat monitor.
    pub activity: Arc<Activity>,
    /// Byte and message counters.
    pub traffic: Arc<TrafficCounters>,
    /// Framing and compression.
    pub codec: Arc<WireCodec>,
    /// Serialized handshake message (datagram channel only).
    pub handshake: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Shared channel state
// ---------------------------------------------------------------------------

/// State common to all variants: flags, the outbound queue, and the
/// attempt's cancellation scope.
pub(crate) struct ChannelCore {
    started: AtomicBool,
    connected: AtomicBool,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl ChannelCore {
    fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel,
        }
    }

    /// Mark the attempt started. Returns `false` if it already was.
    pub(crate) fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mark the channel down, stop sibling loops, and report closure.
    pub(crate) async fn shut(&self, sink: &EventSink, reason: CloseReason) {
        self.set_connected(false);
        self.cancel.cancel();
        match &reason {
            CloseReason::Local => {
                tracing::debug!(attempt = sink.attempt(), "Channel closed locally");
            }
            CloseReason::Failed(e) => {
                tracing::info!(attempt = sink.attempt(), "Channel closed: {e}");
            }
        }
        sink.closed(reason).await;
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), EngineError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(EngineError::NotReady);
        }
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EngineError::ChannelClosed,
        })
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// One connection attempt over one channel kind.
pub enum Channel {
    /// Reliable datagram variant.
    Datagram(DatagramChannel),
    /// Persistent socket variant.
    Socket(SocketChannel),
    /// Poll variant.
    Poll(PollChannel),
}

impl Channel {
    /// Create an unstarted channel whose loops live under `cancel`.
    pub fn new(kind: ChannelKind, settings: &ChannelSettings, cancel: CancellationToken) -> Self {
        let core = ChannelCore::new(settings.send_queue_capacity, cancel);
        match kind {
            ChannelKind::Datagram => {
                Channel::Datagram(DatagramChannel::new(core, settings.clone()))
            }
            ChannelKind::Socket => Channel::Socket(SocketChannel::new(core, settings.clone())),
            ChannelKind::Poll => Channel::Poll(PollChannel::new(core, settings.clone())),
        }
    }

    fn core(&self) -> &ChannelCore {
        match self {
            Channel::Datagram(c) => &c.core,
            Channel::Socket(c) => &c.core,
            Channel::Poll(c) => &c.core,
        }
    }

    /// Channel kind.
    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::Datagram(_) => ChannelKind::Datagram,
            Channel::Socket(_) => ChannelKind::Socket,
            Channel::Poll(_) => ChannelKind::Poll,
        }
    }

    /// Drive one attempt: connect, then run the channel's loops until it
    /// closes. Lifecycle is reported through `ctx.sink` (`Opened` once usable,
    /// `Closed` exactly once at the end), so callers run this in a spawned
    /// task. A second call is a no-op.
    pub async fn connect(&self, endpoint: Endpoint, ctx: ChannelContext) {
        if !self.core().begin() {
            tracing::warn!(attempt = ctx.sink.attempt(), "Channel already started");
            return;
        }
        tracing::debug!(attempt = ctx.sink.attempt(), %endpoint, "Connecting");
        match self {
            Channel::Datagram(c) => c.connect(endpoint, ctx).await,
            Channel::Socket(c) => c.connect(endpoint, ctx).await,
            Channel::Poll(c) => c.connect(endpoint, ctx).await,
        }
    }

    /// Enqueue one serialized message payload. Never blocks.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), EngineError> {
        self.core().send(payload)
    }

    /// Cancel the attempt and every loop it spawned.
    pub fn disconnect(&self) {
        let core = self.core();
        core.set_connected(false);
        core.cancel.cancel();
    }

    /// An attempt is in progress or has succeeded.
    pub fn is_started(&self) -> bool {
        self.core().started.load(Ordering::Acquire)
    }

    /// The channel is usable now.
    pub fn is_connected(&self) -> bool {
        self.core().connected.load(Ordering::Acquire)
    }

    /// Whether the transport keeps itself alive without application pings.
    ///
    /// Only the datagram link has its own keep-alive. Poll channels rely on
    /// the heartbeat's scheduled ping, which also feeds RTT diagnostics.
    pub fn has_native_liveness(&self) -> bool {
        match self {
            Channel::Datagram(_) => true,
            Channel::Socket(_) | Channel::Poll(_) => false,
        }
    }
}
