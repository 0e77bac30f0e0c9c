//! Connection orchestrator: drives channel attempts through [`Failover`] and
//! presents one "current connection" to the rest of the client.
//!
//! A single actor task owns the failover state and the active attempt. It is
//! fed by three sources: commands from [`Orchestrator`] handles, lifecycle
//! notices from channels, and the root cancellation token. Every channel
//! notice carries the attempt id it was issued for; notices from any attempt
//! other than the current one are dropped, so an abandoned attempt that
//! reports late can never touch orchestrator state.
//!
//! Each attempt runs under a child token of the root scope. Abandoning an
//! attempt cancels that token, which stops the channel's loops and anything
//! else (heartbeat monitor) spawned under it.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::channel::{
    AttemptId, Channel, ChannelContext, ChannelEvent, ChannelKind, ChannelNotice, ChannelSettings,
    CloseReason, Endpoint, EventSink, OpenInfo,
};
use crate::codec::WireCodec;
use crate::error::EngineError;
use crate::failover::{ChannelEntry, Failover, Step};
use crate::heartbeat::Activity;
use crate::message::Message;
use crate::request::Outbound;
use crate::stats::{TrafficCounters, TrafficSnapshot};
use crate::store::EndpointStore;

const NOTICE_CAPACITY: usize = 256;

/// Orchestrator-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped.
    Idle,
    /// A channel attempt is in progress.
    Attempting,
    /// The active channel is usable.
    Connected,
    /// The active channel just closed; the next attempt is being chosen.
    Disrupted,
    /// Every candidate failed. Only an explicit start leaves this state.
    Exhausted,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Idle`].
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(ConnectionState::Idle),
        }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Snapshot of one attempt, retained after it closes.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportInfo {
    pub attempt: AttemptId,
    pub kind: ChannelKind,
    pub endpoint: Endpoint,
    /// Time to establish the transport, if it got that far.
    pub connect_latency: Option<Duration>,
    /// Time for the datagram handshake exchange.
    pub handshake_latency: Option<Duration>,
    pub traffic: TrafficSnapshot,
    /// Why the attempt ended; `None` while it is still open.
    pub close_reason: Option<String>,
}

/// Lifecycle events delivered to the client.
#[derive(Debug)]
pub enum LinkEvent {
    /// A new attempt started.
    Attempting {
        attempt: AttemptId,
        kind: ChannelKind,
        endpoint: Endpoint,
    },
    /// The attempt's channel is usable.
    Opened {
        info: TransportInfo,
        /// Traffic signals for heartbeat monitoring.
        activity: Arc<Activity>,
        native_liveness: bool,
        /// The attempt scope; tasks spawned under it die with the attempt.
        scope: CancellationToken,
    },
    /// One inbound message payload from the current attempt.
    Data { attempt: AttemptId, payload: Vec<u8> },
    /// A connected attempt closed; failover continues.
    Disrupted(TransportInfo),
    /// No candidates left. Carries the last attempt, if there was one.
    Exhausted(Option<TransportInfo>),
    /// Stopped on request.
    Stopped,
}

/// Static inputs for the orchestrator.
pub struct OrchestratorConfig {
    /// Channel candidates in failover order.
    pub channels: Vec<(ChannelKind, Vec<Endpoint>)>,
    pub settings: ChannelSettings,
    pub codec: Arc<WireCodec>,
    /// Serialized handshake message for datagram attempts.
    pub handshake: Vec<u8>,
}

enum Command {
    Start,
    Stop,
    Dead(AttemptId),
}

struct ActiveChannel {
    attempt: AttemptId,
    channel: Arc<Channel>,
}

struct Shared {
    state: ConnectionStateWatch,
    active: RwLock<Option<ActiveChannel>>,
    last_info: Mutex<Option<TransportInfo>>,
    codec: Arc<WireCodec>,
}

/// Handle to the orchestrator actor. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    #[cfg(test)]
    notices: mpsc::Sender<ChannelNotice>,
}

impl Orchestrator {
    /// Spawn the actor under `cancel`. Returns the handle and the event
    /// stream; the actor stays idle until [`Orchestrator::start`].
    pub fn spawn(
        config: OrchestratorConfig,
        store: Arc<dyn EndpointStore>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let entries = config
            .channels
            .into_iter()
            .enumerate()
            .map(|(slot, (kind, endpoints))| {
                ChannelEntry::new(kind, endpoints, store.load(slot).unwrap_or(0))
            })
            .collect();
        let shared = Arc::new(Shared {
            state: ConnectionStateWatch::new(),
            active: RwLock::new(None),
            last_info: Mutex::new(None),
            codec: Arc::clone(&config.codec),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::channel(NOTICE_CAPACITY);

        #[cfg(test)]
        let notices = notices_tx.clone();
        let actor = Actor {
            failover: Failover::new(entries),
            store,
            settings: config.settings,
            codec: config.codec,
            handshake: config.handshake,
            shared: Arc::clone(&shared),
            events: events_tx,
            notices_tx,
            next_attempt: 0,
            current: None,
            cancel,
        };
        tokio::spawn(actor.run(commands_rx, notices_rx));

        (
            Self {
                commands: commands_tx,
                shared,
                #[cfg(test)]
                notices,
            },
            events_rx,
        )
    }

    /// Begin a fresh failover sequence. Ignored while an attempt is active.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Abandon the active attempt and go idle.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Heartbeat verdict: `attempt` is dead. Ignored if it is no longer current.
    pub fn report_dead(&self, attempt: AttemptId) {
        let _ = self.commands.send(Command::Dead(attempt));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Snapshot of the most recently closed attempt.
    pub fn last_transport_info(&self) -> Option<TransportInfo> {
        self.shared
            .last_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Attempt id of the connected channel, if any.
    pub fn active_attempt(&self) -> Option<AttemptId> {
        self.shared
            .active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|a| a.attempt)
    }
}

impl Outbound for Orchestrator {
    fn enqueue(&self, message: &Message) -> Result<(), EngineError> {
        let active = self
            .shared
            .active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(active) = active.as_ref() else {
            return Err(EngineError::NotReady);
        };
        let bytes = self
            .shared
            .codec
            .serialize(message)
            .map_err(|e| EngineError::Encode(e.to_string()))?;
        tracing::trace!(
            attempt = active.attempt,
            msg_type = %message.msg_type,
            len = bytes.len(),
            "Enqueue"
        );
        active.channel.send(bytes)
    }
}

struct Attempt {
    id: AttemptId,
    entry: usize,
    endpoint: Endpoint,
    channel: Arc<Channel>,
    scope: CancellationToken,
    activity: Arc<Activity>,
    traffic: Arc<TrafficCounters>,
    open: Option<OpenInfo>,
}

impl Attempt {
    fn info(&self, close_reason: Option<String>) -> TransportInfo {
        TransportInfo {
            attempt: self.id,
            kind: self.channel.kind(),
            endpoint: self.endpoint.clone(),
            connect_latency: self.open.map(|o| o.connect_latency),
            handshake_latency: self.open.and_then(|o| o.handshake_latency),
            traffic: self.traffic.snapshot(),
            close_reason,
        }
    }
}

struct Actor {
    failover: Failover,
    store: Arc<dyn EndpointStore>,
    settings: ChannelSettings,
    codec: Arc<WireCodec>,
    handshake: Vec<u8>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<LinkEvent>,
    notices_tx: mpsc::Sender<ChannelNotice>,
    next_attempt: AttemptId,
    current: Option<Attempt>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut notices: mpsc::Receiver<ChannelNotice>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Start) => self.start(),
                    Some(Command::Stop) => self.stop(),
                    Some(Command::Dead(attempt)) => self.dead(attempt),
                    None => break,
                },
                Some(notice) = notices.recv() => self.notice(notice),
            }
        }
        self.abandon();
        tracing::debug!("Orchestrator stopped");
    }

    fn start(&mut self) {
        if self.current.is_some() {
            tracing::debug!("Start ignored, attempt already active");
            return;
        }
        tracing::info!("Starting connection sequence");
        let step = self.failover.begin();
        self.advance(step, None);
    }

    fn stop(&mut self) {
        if let Some(attempt) = self.abandon() {
            self.remember(attempt.info(Some("stopped".into())));
        }
        self.failover.reset();
        self.shared.state.set(ConnectionState::Idle);
        self.emit(LinkEvent::Stopped);
    }

    fn dead(&mut self, attempt: AttemptId) {
        if self.current.as_ref().map(|a| a.id) != Some(attempt) {
            tracing::debug!(attempt, "Ignoring stale dead report");
            return;
        }
        tracing::warn!(attempt, "Heartbeat declared channel dead");
        self.closed("heartbeat timeout".into());
    }

    fn notice(&mut self, notice: ChannelNotice) {
        let Some(current) = self.current.as_mut().filter(|a| a.id == notice.attempt) else {
            tracing::trace!(attempt = notice.attempt, "Ignoring stale channel notice");
            return;
        };
        match notice.event {
            ChannelEvent::Opened(open) => {
                current.open = Some(open);
                let info = current.info(None);
                let activity = Arc::clone(&current.activity);
                let native_liveness = current.channel.has_native_liveness();
                let scope = current.scope.clone();
                *self
                    .shared
                    .active
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(ActiveChannel {
                    attempt: current.id,
                    channel: Arc::clone(&current.channel),
                });
                self.failover.on_connected();
                self.shared.state.set(ConnectionState::Connected);
                tracing::info!(
                    attempt = info.attempt,
                    kind = %info.kind,
                    endpoint = %info.endpoint,
                    connect = ?info.connect_latency,
                    "Connected"
                );
                self.emit(LinkEvent::Opened {
                    info,
                    activity,
                    native_liveness,
                    scope,
                });
            }
            ChannelEvent::Data(payload) => {
                let attempt = current.id;
                self.emit(LinkEvent::Data { attempt, payload });
            }
            ChannelEvent::Closed(reason) => {
                let reason = match reason {
                    CloseReason::Local => "closed locally".to_string(),
                    CloseReason::Failed(e) => e.to_string(),
                };
                self.closed(reason);
            }
        }
    }

    /// The current attempt is over: publish it and move to the next step.
    fn closed(&mut self, reason: String) {
        let Some(attempt) = self.abandon() else {
            return;
        };
        let was_connected = attempt.open.is_some();
        let info = attempt.info(Some(reason));
        self.remember(info.clone());
        if was_connected {
            tracing::info!(attempt = info.attempt, kind = %info.kind, "Connection disrupted");
            self.shared.state.set(ConnectionState::Disrupted);
            self.emit(LinkEvent::Disrupted(info.clone()));
        } else {
            tracing::warn!(
                attempt = info.attempt,
                kind = %info.kind,
                endpoint = %info.endpoint,
                reason = info.close_reason.as_deref().unwrap_or_default(),
                "Attempt failed"
            );
        }

        let step = self.failover.on_closed();
        if let Some(entry) = self.failover.entries().get(attempt.entry) {
            self.store.save(attempt.entry, entry.index());
        }
        self.advance(step, Some(info));
    }

    fn advance(&mut self, step: Step, last: Option<TransportInfo>) {
        match step {
            Step::Connect { entry, endpoint } => self.launch(entry, endpoint),
            Step::Exhausted => {
                tracing::error!("All transports exhausted");
                self.shared.state.set(ConnectionState::Exhausted);
                self.emit(LinkEvent::Exhausted(last));
            }
        }
    }

    fn launch(&mut self, entry: usize, endpoint: Endpoint) {
        self.next_attempt += 1;
        let id = self.next_attempt;
        let kind = endpoint.kind;
        let scope = self.cancel.child_token();
        let channel = Arc::new(Channel::new(kind, &self.settings, scope.clone()));
        let activity = Arc::new(Activity::new());
        let traffic = Arc::new(TrafficCounters::new());
        let ctx = ChannelContext {
            sink: EventSink::new(id, self.notices_tx.clone()),
            activity: Arc::clone(&activity),
            traffic: Arc::clone(&traffic),
            codec: Arc::clone(&self.codec),
            handshake: self.handshake.clone(),
        };

        tracing::info!(attempt = id, kind = %kind, endpoint = %endpoint, "Attempting");
        self.shared.state.set(ConnectionState::Attempting);
        self.emit(LinkEvent::Attempting {
            attempt: id,
            kind,
            endpoint: endpoint.clone(),
        });

        let task_channel = Arc::clone(&channel);
        let task_endpoint = endpoint.clone();
        tokio::spawn(async move { task_channel.connect(task_endpoint, ctx).await });

        self.current = Some(Attempt {
            id,
            entry,
            endpoint,
            channel,
            scope,
            activity,
            traffic,
            open: None,
        });
    }

    /// Detach and cancel the current attempt.
    fn abandon(&mut self) -> Option<Attempt> {
        let attempt = self.current.take()?;
        self.shared
            .active
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        attempt.channel.disconnect();
        attempt.scope.cancel();
        Some(attempt)
    }

    fn remember(&self, info: TransportInfo) {
        *self
            .shared
            .last_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(info);
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEndpointStore;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config(channels: Vec<(ChannelKind, Vec<Endpoint>)>) -> OrchestratorConfig {
        OrchestratorConfig {
            channels,
            settings: ChannelSettings {
                connect_timeout: Duration::from_secs(2),
                ..ChannelSettings::default()
            },
            codec: Arc::new(WireCodec::default()),
            handshake: Vec::new(),
        }
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event stream closed")
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_exhausts_after_failed_candidates() {
        let dead = closed_port().await;
        let (orchestrator, mut events) = Orchestrator::spawn(
            config(vec![(
                ChannelKind::Socket,
                vec![Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(dead))],
            )]),
            Arc::new(MemoryEndpointStore::new()),
            CancellationToken::new(),
        );
        assert_eq!(orchestrator.state(), ConnectionState::Idle);
        orchestrator.start();

        let mut attempts = 0;
        loop {
            match next(&mut events).await {
                LinkEvent::Attempting { .. } => attempts += 1,
                LinkEvent::Exhausted(Some(info)) => {
                    assert_eq!(info.kind, ChannelKind::Socket);
                    assert!(info.close_reason.is_some());
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        // One attempt plus one retry at the next (same) endpoint.
        assert_eq!(attempts, 2);
        assert_eq!(orchestrator.state(), ConnectionState::Exhausted);
        assert!(orchestrator.last_transport_info().is_some());
    }

    #[tokio::test]
    async fn test_connect_then_enqueue_then_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.unwrap();
            u32::from_le_bytes(len)
        });

        let store = Arc::new(MemoryEndpointStore::new());
        let (orchestrator, mut events) = Orchestrator::spawn(
            config(vec![(
                ChannelKind::Socket,
                vec![Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(port))],
            )]),
            store,
            CancellationToken::new(),
        );
        assert_eq!(orchestrator.enqueue(&Message::new("x")), Err(EngineError::NotReady));
        orchestrator.start();

        assert!(matches!(next(&mut events).await, LinkEvent::Attempting { attempt: 1, .. }));
        let LinkEvent::Opened { info, native_liveness, .. } = next(&mut events).await else {
            panic!("expected Opened");
        };
        assert_eq!(info.attempt, 1);
        assert!(!native_liveness);
        assert_eq!(orchestrator.state(), ConnectionState::Connected);
        assert_eq!(orchestrator.active_attempt(), Some(1));

        orchestrator.enqueue(&Message::new("user.ping")).unwrap();
        let frame_len = server.await.unwrap();
        assert!(frame_len > 0);

        orchestrator.stop();
        assert!(matches!(next(&mut events).await, LinkEvent::Stopped));
        assert_eq!(orchestrator.state(), ConnectionState::Idle);
        assert_eq!(orchestrator.active_attempt(), None);
        assert_eq!(orchestrator.enqueue(&Message::new("x")), Err(EngineError::NotReady));
    }

    #[tokio::test]
    async fn test_blank_first_entry_never_attempted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (orchestrator, mut events) = Orchestrator::spawn(
            config(vec![
                (ChannelKind::Socket, vec![Endpoint::new(ChannelKind::Socket, "", Some(port))]),
                (
                    ChannelKind::Socket,
                    vec![Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(port))],
                ),
            ]),
            Arc::new(MemoryEndpointStore::new()),
            CancellationToken::new(),
        );
        orchestrator.start();
        let LinkEvent::Attempting { endpoint, .. } = next(&mut events).await else {
            panic!("expected Attempting");
        };
        assert_eq!(endpoint.address, "127.0.0.1");
        assert!(matches!(next(&mut events).await, LinkEvent::Opened { .. }));
    }

    #[tokio::test]
    async fn test_stale_dead_report_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (orchestrator, mut events) = Orchestrator::spawn(
            config(vec![(
                ChannelKind::Socket,
                vec![Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(port))],
            )]),
            Arc::new(MemoryEndpointStore::new()),
            CancellationToken::new(),
        );
        orchestrator.start();
        next(&mut events).await;
        assert!(matches!(next(&mut events).await, LinkEvent::Opened { .. }));

        orchestrator.report_dead(99);
        orchestrator.report_dead(1);
        let LinkEvent::Disrupted(info) = next(&mut events).await else {
            panic!("expected Disrupted");
        };
        assert_eq!(info.attempt, 1);
        assert_eq!(info.close_reason.as_deref(), Some("heartbeat timeout"));
        assert!(matches!(next(&mut events).await, LinkEvent::Attempting { attempt: 2, .. }));
    }

    #[tokio::test]
    async fn test_notices_from_abandoned_attempt_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (orchestrator, mut events) = Orchestrator::spawn(
            config(vec![(
                ChannelKind::Socket,
                vec![Endpoint::new(ChannelKind::Socket, "127.0.0.1", Some(port))],
            )]),
            Arc::new(MemoryEndpointStore::new()),
            CancellationToken::new(),
        );
        orchestrator.start();
        next(&mut events).await;
        assert!(matches!(next(&mut events).await, LinkEvent::Opened { .. }));

        // Abandon attempt 1; attempt 2 connects through the listen backlog.
        orchestrator.report_dead(1);
        assert!(matches!(next(&mut events).await, LinkEvent::Disrupted(_)));
        assert!(matches!(next(&mut events).await, LinkEvent::Attempting { attempt: 2, .. }));
        let LinkEvent::Opened { info, .. } = next(&mut events).await else {
            panic!("expected Opened");
        };
        assert_eq!(info.attempt, 2);

        for event in [
            ChannelEvent::Opened(OpenInfo::default()),
            ChannelEvent::Data(vec![1, 2, 3]),
            ChannelEvent::Closed(CloseReason::Local),
        ] {
            orchestrator
                .notices
                .send(ChannelNotice { attempt: 1, event })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            events.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
        assert_eq!(orchestrator.state(), ConnectionState::Connected);
        assert_eq!(orchestrator.active_attempt(), Some(2));
        assert_eq!(orchestrator.last_transport_info().map(|i| i.attempt), Some(1));
        drop(listener);
    }
}
