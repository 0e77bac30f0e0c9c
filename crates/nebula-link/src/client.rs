//! The client facade: wires the orchestrator, request engine and heartbeat
//! monitor together behind one handle.
//!
//! Orchestrator events are consumed by a single pump task, which runs the
//! login exchange, starts the heartbeat monitor once the session is
//! authenticated, routes inbound messages to the request engine, and
//! re-publishes everything as [`ClientEvent`]s on a broadcast channel.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::channel::{AttemptId, ChannelKind, Endpoint};
use crate::codec::{EncodeError, WireCodec};
use crate::context::{Authenticator, ClientContext};
use crate::diagnostics::{DiagnosticsTracker, LinkDiagnostics};
use crate::error::{EngineError, RequestError};
use crate::heartbeat::{Activity, HeartbeatConfig, HeartbeatMonitor, PingSink};
use crate::message::Message;
use crate::orchestrator::{
    ConnectionState, LinkEvent, Orchestrator, OrchestratorConfig, TransportInfo,
};
use crate::request::{Callback, Outbound, RequestEngine, RequestHandle};
use crate::restart::{RestartPolicy, RestartState};
use crate::value::{Payload, Value};

const EVENT_CAPACITY: usize = 256;

/// What subscribers see.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Any application message from the server, responses included.
    MessageReceived(Message),
    /// A channel is usable; authentication follows.
    ConnectionOpened(TransportInfo),
    /// Terminal: every transport was exhausted, or login was rejected.
    ConnectionClosed(Option<TransportInfo>),
    /// A connected channel closed and failover is in progress.
    ConnectionDisrupted(TransportInfo),
    /// A new connection attempt started.
    Attempting { kind: ChannelKind, endpoint: Endpoint },
    /// The session is authenticated; parked requests are going out.
    Authenticated,
}

/// Handle to a running client. Clones share the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    orchestrator: Orchestrator,
    engine: Arc<RequestEngine>,
    events: broadcast::Sender<ClientEvent>,
    diagnostics: Arc<Mutex<DiagnosticsTracker>>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.engine.dispose();
        self.cancel.cancel();
    }
}

impl Client {
    /// Build the client and spawn its tasks. Nothing connects until
    /// [`Client::start`]. Must be called inside a Tokio runtime.
    pub fn new(ctx: ClientContext) -> Result<Self, EncodeError> {
        let ClientContext {
            config,
            auth,
            store,
            codec,
        } = ctx;
        let cancel = CancellationToken::new();
        let codec = Arc::new(WireCodec::new(config.codec.clone(), codec));
        let handshake = codec.serialize(&auth.handshake_message())?;

        if let Some(login) = auth.login_request()
            && login.msg_type != config.requests.login_type
        {
            tracing::warn!(
                msg_type = %login.msg_type,
                expected = %config.requests.login_type,
                "Login request type differs from the configured one; it waits for authentication"
            );
        }

        let (orchestrator, link_events) = Orchestrator::spawn(
            OrchestratorConfig {
                channels: config
                    .channels
                    .iter()
                    .map(|c| (c.kind, c.endpoints.clone()))
                    .collect(),
                settings: config.channel.clone(),
                codec: Arc::clone(&codec),
                handshake,
            },
            store,
            cancel.child_token(),
        );
        let outbound: Arc<dyn Outbound> = Arc::new(orchestrator.clone());
        let engine = RequestEngine::new(config.requests.clone(), outbound, cancel.child_token());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let diagnostics = Arc::new(Mutex::new(DiagnosticsTracker::new(config.diagnostics.clone())));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let pump = Pump {
            auth,
            engine: Arc::clone(&engine),
            orchestrator: orchestrator.clone(),
            codec,
            heartbeat: config.heartbeat.clone(),
            diagnostics: Arc::clone(&diagnostics),
            events: events.clone(),
            internal_tx,
            session: None,
        };
        tokio::spawn(pump.run(link_events, internal_rx, cancel.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                orchestrator,
                engine,
                events,
                diagnostics,
                cancel,
            }),
        })
    }

    /// Begin a failover sequence. Also the way out of `Exhausted`.
    pub fn start(&self) {
        self.inner.orchestrator.start();
    }

    /// Drop the current connection and stay idle. Outstanding requests are
    /// kept and go out after the next successful start.
    pub fn stop(&self) {
        self.inner.orchestrator.stop();
    }

    /// Submit a request; `callback` fires exactly once.
    pub fn send(
        &self,
        msg_type: impl Into<String>,
        payload: Payload,
        callback: Callback,
    ) -> RequestHandle {
        self.inner.engine.send(msg_type, payload, callback)
    }

    /// Submit a request and await its outcome.
    pub async fn request(
        &self,
        msg_type: impl Into<String>,
        payload: Payload,
    ) -> Result<Message, RequestError> {
        self.inner.engine.request(msg_type, payload).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.orchestrator.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.orchestrator.subscribe_state()
    }

    /// Snapshot of the most recently closed attempt.
    pub fn last_transport_info(&self) -> Option<TransportInfo> {
        self.inner.orchestrator.last_transport_info()
    }

    /// RTT, jitter and ping loss from heartbeat traffic.
    pub fn diagnostics(&self) -> LinkDiagnostics {
        let mut tracker = self
            .inner
            .diagnostics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tracker.expire_pending(Instant::now());
        tracker.snapshot()
    }

    /// Fail every outstanding request with `Disposed` and stop all tasks.
    pub fn dispose(&self) {
        self.inner.engine.dispose();
        self.inner.orchestrator.stop();
        self.inner.cancel.cancel();
    }

    /// Restart the failover sequence with exponential backoff until a
    /// session authenticates. Returns `false` when the policy runs out or the
    /// client is disposed.
    pub async fn restart_with_backoff(&self, policy: RestartPolicy) -> bool {
        let cancel = self.inner.cancel.clone();
        let mut events = self.subscribe();
        let mut restart = RestartState::new(policy);

        while let Some(delay) = restart.next_delay() {
            tracing::info!(restart = restart.attempts(), "Restarting connection in {delay:?}");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            self.start();
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return false,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ClientEvent::Authenticated) => return true,
                    Ok(ClientEvent::ConnectionClosed(_)) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return false,
                }
            }
        }
        tracing::warn!("Restart policy exhausted");
        false
    }
}

enum Internal {
    Login {
        attempt: AttemptId,
        result: Result<Message, RequestError>,
    },
}

struct Session {
    attempt: AttemptId,
    activity: Arc<Activity>,
    native_liveness: bool,
    scope: CancellationToken,
    info: TransportInfo,
    login: Option<RequestHandle>,
}

struct Pump {
    auth: Arc<dyn Authenticator>,
    engine: Arc<RequestEngine>,
    orchestrator: Orchestrator,
    codec: Arc<WireCodec>,
    heartbeat: HeartbeatConfig,
    diagnostics: Arc<Mutex<DiagnosticsTracker>>,
    events: broadcast::Sender<ClientEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    session: Option<Session>,
}

impl Pump {
    async fn run(
        mut self,
        mut link: mpsc::UnboundedReceiver<LinkEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = link.recv() => match event {
                    Some(event) => self.link_event(event),
                    None => break,
                },
                Some(event) = internal.recv() => self.internal_event(event),
            }
        }
        self.end_session();
        tracing::debug!("Client pump stopped");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Attempting { kind, endpoint, .. } => {
                self.emit(ClientEvent::Attempting { kind, endpoint });
            }
            LinkEvent::Opened {
                info,
                activity,
                native_liveness,
                scope,
            } => self.opened(info, activity, native_liveness, scope),
            LinkEvent::Data { attempt, payload } => self.data(attempt, &payload),
            LinkEvent::Disrupted(info) => {
                self.end_session();
                self.engine.on_connection_lost();
                self.emit(ClientEvent::ConnectionDisrupted(info));
            }
            LinkEvent::Exhausted(info) => {
                self.end_session();
                self.engine.on_exhausted();
                self.emit(ClientEvent::ConnectionClosed(info));
            }
            LinkEvent::Stopped => {
                self.end_session();
                self.engine.on_connection_lost();
            }
        }
    }

    fn opened(
        &mut self,
        info: TransportInfo,
        activity: Arc<Activity>,
        native_liveness: bool,
        scope: CancellationToken,
    ) {
        let attempt = info.attempt;
        self.session = Some(Session {
            attempt,
            activity,
            native_liveness,
            scope,
            info: info.clone(),
            login: None,
        });
        self.emit(ClientEvent::ConnectionOpened(info));
        self.engine.on_connected();

        match self.auth.login_request() {
            Some(login) => {
                tracing::debug!(attempt, msg_type = %login.msg_type, "Sending login");
                let tx = self.internal_tx.clone();
                let handle = self.engine.send(
                    login.msg_type,
                    login.payload,
                    Box::new(move |result| {
                        let _ = tx.send(Internal::Login { attempt, result });
                    }),
                );
                if let Some(session) = self.session.as_mut() {
                    session.login = Some(handle);
                }
            }
            None => self.authenticated(),
        }
    }

    fn internal_event(&mut self, event: Internal) {
        match event {
            Internal::Login { attempt, result } => {
                if self.session.as_ref().map(|s| s.attempt) != Some(attempt) {
                    return;
                }
                match result {
                    Ok(response) => match self.auth.accept_login(&response) {
                        Ok(()) => self.authenticated(),
                        Err(reason) => self.reject(&reason),
                    },
                    Err(RequestError::Application { code, .. }) => self.reject(&code),
                    Err(
                        RequestError::ConnectionLost
                        | RequestError::Cancelled
                        | RequestError::Disposed,
                    ) => {}
                    Err(e) => {
                        tracing::warn!(attempt, "Login failed: {e}");
                        self.orchestrator.report_dead(attempt);
                    }
                }
            }
        }
    }

    fn authenticated(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        tracing::info!(
            attempt = session.attempt,
            identity = ?self.auth.identity(),
            "Session authenticated"
        );
        self.engine.on_authenticated();
        self.emit(ClientEvent::Authenticated);

        let sink = Arc::new(ClientPingSink {
            attempt: session.attempt,
            orchestrator: self.orchestrator.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            ping_type: self.heartbeat.ping_type.clone(),
        });
        HeartbeatMonitor::new(
            self.heartbeat.clone(),
            Arc::clone(&session.activity),
            session.native_liveness,
            sink,
            session.scope.clone(),
        )
        .spawn();
    }

    /// Login refused: terminal until the caller starts again.
    fn reject(&mut self, reason: &str) {
        tracing::warn!("Login rejected: {reason}");
        let info = self.session.take().map(|s| {
            let mut info = s.info;
            info.close_reason = Some(format!("login rejected: {reason}"));
            info
        });
        self.orchestrator.stop();
        self.engine.on_exhausted();
        self.emit(ClientEvent::ConnectionClosed(info));
    }

    fn data(&mut self, attempt: AttemptId, payload: &[u8]) {
        let Some(session) = self.session.as_ref().filter(|s| s.attempt == attempt) else {
            return;
        };
        let message = match self.codec.deserialize(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(attempt, "Dropping undecodable message: {e}");
                return;
            }
        };

        if message.msg_type == self.heartbeat.pong_type {
            session.activity.mark_pong();
            let sequence = message
                .payload
                .get("seq")
                .and_then(Value::as_i64)
                .and_then(|s| u32::try_from(s).ok());
            if let Some(sequence) = sequence {
                let rtt = self
                    .diagnostics
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .on_pong_received(sequence, Instant::now());
                tracing::trace!(attempt, sequence, ?rtt, "Pong");
            }
            return;
        }
        if message.msg_type == self.heartbeat.ping_type && message.request_id.is_none() {
            let pong = Message::new(self.heartbeat.pong_type.clone()).with_payload(message.payload);
            if let Err(e) = self.orchestrator.enqueue(&pong) {
                tracing::debug!(attempt, "Pong not sent: {e}");
            }
            return;
        }

        tracing::trace!(
            attempt,
            msg_type = %message.msg_type,
            request_id = ?message.request_id,
            "Inbound message"
        );
        self.engine.on_response(&message);
        self.emit(ClientEvent::MessageReceived(message));
    }

    fn end_session(&mut self) {
        if let Some(session) = self.session.take()
            && let Some(login) = session.login
        {
            login.cancel();
        }
    }
}

struct ClientPingSink {
    attempt: AttemptId,
    orchestrator: Orchestrator,
    diagnostics: Arc<Mutex<DiagnosticsTracker>>,
    ping_type: String,
}

impl PingSink for ClientPingSink {
    fn send_ping(&self) -> Result<(), EngineError> {
        let sequence = {
            let now = Instant::now();
            let mut tracker = self
                .diagnostics
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            tracker.expire_pending(now);
            tracker.on_ping_sent(now)
        };
        let ping = Message::new(self.ping_type.clone())
            .with_payload(Payload::new().with("seq", sequence));
        tracing::trace!(attempt = self.attempt, sequence, "Ping");
        self.orchestrator.enqueue(&ping)
    }

    fn report_dead(&self) {
        self.orchestrator.report_dead(self.attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;

    #[tokio::test]
    async fn test_request_before_start_waits_and_dispose_fails_it() {
        let client = Client::new(ClientContext::new(LinkConfig::default())).unwrap();
        assert_eq!(client.state(), ConnectionState::Idle);

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request("user.profile", Payload::new()).await }
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        client.dispose();
        assert_eq!(pending.await.unwrap(), Err(RequestError::Disposed));
        assert_eq!(
            client.request("user.profile", Payload::new()).await,
            Err(RequestError::Disposed)
        );
    }

    #[tokio::test]
    async fn test_no_channels_closes_immediately() {
        let client = Client::new(ClientContext::new(LinkConfig::default())).unwrap();
        let mut events = client.subscribe();
        client.start();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ClientEvent::ConnectionClosed(None)));
        assert_eq!(client.state(), ConnectionState::Exhausted);
        assert_eq!(client.diagnostics().sample_count, 0);
    }
}
