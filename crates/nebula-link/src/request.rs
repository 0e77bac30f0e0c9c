//! Request engine: turns "send type X with payload Y, call me back" into
//! wire traffic.
//!
//! The engine tracks every request from submission until its callback fires.
//! It merges concurrent duplicates, holds requests until the session is ready
//! (the login request only needs a connected transport), retries an
//! allow-listed set of server error codes, and guarantees each callback runs
//! exactly once. Callbacks always run outside the registry lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, RequestError};
use crate::message::Message;
use crate::value::{Payload, Value};

/// Receives the final outcome of a request.
pub type Callback = Box<dyn FnOnce(Result<Message, RequestError>) + Send + 'static>;

/// Puts a message on the current wire.
pub trait Outbound: Send + Sync {
    /// Enqueue without blocking. `NotReady` means "no usable channel now".
    fn enqueue(&self, message: &Message) -> Result<(), EngineError>;
}

/// Request policy.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Server error codes retried inside the engine.
    pub retryable_codes: Vec<String>,
    /// Retries per request for retryable codes. Default: 3.
    pub retry_count: u32,
    /// Delay before each retry. Default: 1 s.
    pub retry_delay: Duration,
    /// Response deadline; zero disables it. Default: 30 s.
    pub request_timeout: Duration,
    /// Message type -> payload fields that make two requests "the same".
    /// Types without a rule are never merged.
    pub merge_rules: HashMap<String, Vec<String>>,
    /// Type of the login request, which may go out before authentication.
    pub login_type: String,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            retryable_codes: vec!["ServiceUnavailable".to_string()],
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            merge_rules: HashMap::new(),
            login_type: "user.login".to_string(),
        }
    }
}

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    /// Parked until the session becomes ready.
    WaitingForReady,
    /// Handed to the outbound queue.
    Sent,
    WaitingForResponse,
    /// The callback has fired.
    Completed,
    /// The engine was disposed.
    Disposed,
}

type MergeKey = (String, Vec<u8>);

struct Pending {
    msg_type: String,
    payload: Payload,
    merge: Option<MergeKey>,
    subscribers: Vec<(u64, Callback)>,
    retries_left: u32,
    state: RequestState,
    /// Owns this request's timeout and retry-delay tasks.
    scope: CancellationToken,
    /// Bumped on every (re)dispatch; stale timers compare against it.
    generation: u64,
    /// Waiting out the retry delay; readiness changes do not release it.
    retry_pending: bool,
}

#[derive(Default)]
struct Registry {
    next_id: u32,
    next_subscriber: u64,
    connected: bool,
    authenticated: bool,
    disposed: bool,
    pending: BTreeMap<u32, Pending>,
    merged: HashMap<MergeKey, u32>,
}

impl Registry {
    fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.pending.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    fn remove(&mut self, id: u32) -> Option<Pending> {
        let pending = self.pending.remove(&id)?;
        if let Some(key) = &pending.merge
            && self.merged.get(key) == Some(&id)
        {
            self.merged.remove(key);
        }
        pending.scope.cancel();
        Some(pending)
    }
}

/// The request engine. Create with [`RequestEngine::new`].
pub struct RequestEngine {
    config: RequestConfig,
    outbound: Arc<dyn Outbound>,
    registry: Mutex<Registry>,
    scope: CancellationToken,
    me: Weak<RequestEngine>,
}

impl RequestEngine {
    /// `scope` is the client scope; every request timer lives under it.
    pub fn new(
        config: RequestConfig,
        outbound: Arc<dyn Outbound>,
        scope: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            outbound,
            registry: Mutex::new(Registry::default()),
            scope,
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Submit a request. The callback fires exactly once.
    pub fn send(
        &self,
        msg_type: impl Into<String>,
        payload: Payload,
        callback: Callback,
    ) -> RequestHandle {
        let msg_type = msg_type.into();
        let merge = self.merge_key(&msg_type, &payload);

        let mut registry = self.lock();
        if registry.disposed {
            drop(registry);
            callback(Err(RequestError::Disposed));
            return RequestHandle::detached(self.me.clone());
        }

        registry.next_subscriber += 1;
        let subscriber = registry.next_subscriber;

        if let Some(key) = &merge
            && let Some(&id) = registry.merged.get(key)
            && let Some(existing) = registry.pending.get_mut(&id)
        {
            existing.subscribers.push((subscriber, callback));
            tracing::debug!(request_id = id, msg_type = %msg_type, "Merged into in-flight request");
            return RequestHandle {
                engine: self.me.clone(),
                request_id: id,
                subscriber,
            };
        }

        let id = registry.allocate_id();
        if let Some(key) = &merge {
            registry.merged.insert(key.clone(), id);
        }
        registry.pending.insert(
            id,
            Pending {
                msg_type,
                payload,
                merge,
                subscribers: vec![(subscriber, callback)],
                retries_left: self.config.retry_count,
                state: RequestState::Created,
                scope: self.scope.child_token(),
                generation: 0,
                retry_pending: false,
            },
        );
        drop(registry);

        self.dispatch(id);
        RequestHandle {
            engine: self.me.clone(),
            request_id: id,
            subscriber,
        }
    }

    /// Submit and await the outcome.
    pub async fn request(
        &self,
        msg_type: impl Into<String>,
        payload: Payload,
    ) -> Result<Message, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            msg_type,
            payload,
            Box::new(move |result: Result<Message, RequestError>| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or(Err(RequestError::Disposed))
    }

    /// Current state of request `id`.
    pub fn state(&self, id: u32) -> Option<RequestState> {
        self.lock().pending.get(&id).map(|p| p.state)
    }

    /// Requests not yet completed.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// The transport is usable; the login request may go out.
    pub fn on_connected(&self) {
        let ids = {
            let mut registry = self.lock();
            registry.connected = true;
            self.ready_ids(&registry)
        };
        self.dispatch_all(ids);
    }

    /// The session is authenticated; everything parked goes out in
    /// submission order.
    pub fn on_authenticated(&self) {
        let ids = {
            let mut registry = self.lock();
            registry.connected = true;
            registry.authenticated = true;
            self.ready_ids(&registry)
        };
        self.dispatch_all(ids);
    }

    /// The channel went away. In-flight requests park until the next
    /// readiness transition; nothing is sent until then.
    pub fn on_connection_lost(&self) {
        let mut registry = self.lock();
        registry.connected = false;
        registry.authenticated = false;
        let scope = &self.scope;
        for (id, pending) in registry.pending.iter_mut() {
            if matches!(pending.state, RequestState::Sent | RequestState::WaitingForResponse) {
                tracing::debug!(
                    request_id = *id,
                    msg_type = %pending.msg_type,
                    "Re-queueing in-flight request"
                );
                pending.state = RequestState::WaitingForReady;
                pending.generation += 1;
                pending.scope.cancel();
                pending.scope = scope.child_token();
            }
        }
    }

    /// Every transport failed: fail everything outstanding.
    pub fn on_exhausted(&self) {
        let drained = {
            let mut registry = self.lock();
            registry.connected = false;
            registry.authenticated = false;
            Self::drain(&mut registry)
        };
        Self::fail_all(drained, RequestError::ConnectionLost);
    }

    /// Fail everything outstanding and refuse new requests.
    pub fn dispose(&self) {
        let drained = {
            let mut registry = self.lock();
            if registry.disposed {
                return;
            }
            registry.disposed = true;
            registry.connected = false;
            Self::drain(&mut registry)
        };
        self.scope.cancel();
        Self::fail_all(drained, RequestError::Disposed);
    }

    /// Route a server message. Returns `true` if it answered a pending
    /// request.
    pub fn on_response(&self, message: &Message) -> bool {
        let Some(id) = message.request_id else {
            return false;
        };
        let retry = {
            let mut registry = self.lock();
            let Some(pending) = registry.pending.get_mut(&id) else {
                tracing::debug!(request_id = id, "Response for unknown request");
                return false;
            };
            match message.error_code.as_deref() {
                Some(code)
                    if pending.retries_left > 0
                        && self.config.retryable_codes.iter().any(|c| c == code) =>
                {
                    pending.retries_left -= 1;
                    pending.state = RequestState::WaitingForReady;
                    pending.retry_pending = true;
                    pending.generation += 1;
                    pending.scope.cancel();
                    pending.scope = self.scope.child_token();
                    tracing::warn!(
                        request_id = id,
                        msg_type = %pending.msg_type,
                        code,
                        retries_left = pending.retries_left,
                        "Retryable error, retrying after {:?}",
                        self.config.retry_delay
                    );
                    Some((pending.scope.clone(), pending.generation))
                }
                _ => None,
            }
        };

        match retry {
            Some((scope, generation)) => self.schedule_retry(id, generation, scope),
            None => {
                let outcome = match &message.error_code {
                    Some(code) => Err(RequestError::Application {
                        code: code.clone(),
                        response: message.clone(),
                    }),
                    None => Ok(message.clone()),
                };
                self.finish(id, outcome);
            }
        }
        true
    }

    /// Detach one subscriber. The request is dropped when none remain.
    fn cancel(&self, id: u32, subscriber: u64) {
        let callback = {
            let mut registry = self.lock();
            let Some(pending) = registry.pending.get_mut(&id) else {
                return;
            };
            let Some(pos) = pending.subscribers.iter().position(|(s, _)| *s == subscriber) else {
                return;
            };
            let (_, callback) = pending.subscribers.remove(pos);
            if pending.subscribers.is_empty() {
                registry.remove(id);
            }
            callback
        };
        tracing::debug!(request_id = id, "Request cancelled");
        callback(Err(RequestError::Cancelled));
    }

    fn merge_key(&self, msg_type: &str, payload: &Payload) -> Option<MergeKey> {
        let fields = self.config.merge_rules.get(msg_type)?;
        let values = fields
            .iter()
            .map(|f| payload.get(f).cloned().unwrap_or(Value::Nil))
            .collect::<Vec<_>>();
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &Value::List(values).to_msgpack()).ok()?;
        Some((msg_type.to_string(), bytes))
    }

    fn is_ready(&self, registry: &Registry, msg_type: &str) -> bool {
        !registry.disposed
            && registry.connected
            && (registry.authenticated || msg_type == self.config.login_type)
    }

    fn ready_ids(&self, registry: &Registry) -> Vec<u32> {
        registry
            .pending
            .iter()
            .filter(|(_, p)| {
                matches!(p.state, RequestState::Created | RequestState::WaitingForReady)
            })
            .filter(|(_, p)| !p.retry_pending && self.is_ready(registry, &p.msg_type))
            .map(|(id, _)| *id)
            .collect()
    }

    fn dispatch_all(&self, ids: Vec<u32>) {
        for id in ids {
            self.dispatch(id);
        }
    }

    /// Send `id` if the session is ready, otherwise park it.
    fn dispatch(&self, id: u32) {
        let (message, generation) = {
            let mut registry = self.lock();
            let ready = match registry.pending.get(&id) {
                Some(p)
                    if !p.retry_pending
                        && matches!(
                            p.state,
                            RequestState::Created | RequestState::WaitingForReady
                        ) =>
                {
                    self.is_ready(&registry, &p.msg_type)
                }
                _ => return,
            };
            let Some(pending) = registry.pending.get_mut(&id) else {
                return;
            };
            if !ready {
                pending.state = RequestState::WaitingForReady;
                return;
            }
            pending.state = RequestState::Sent;
            pending.generation += 1;
            let message = Message::new(pending.msg_type.clone())
                .with_request_id(id)
                .with_payload(pending.payload.clone());
            (message, pending.generation)
        };

        match self.outbound.enqueue(&message) {
            Ok(()) => {
                tracing::debug!(request_id = id, msg_type = %message.msg_type, "Request sent");
                let mut registry = self.lock();
                if let Some(pending) = registry.pending.get_mut(&id)
                    && pending.generation == generation
                    && pending.state == RequestState::Sent
                {
                    pending.state = RequestState::WaitingForResponse;
                    let scope = pending.scope.clone();
                    drop(registry);
                    self.arm_timeout(id, generation, scope);
                }
            }
            Err(EngineError::NotReady) => {
                tracing::debug!(request_id = id, "Channel not ready, parking request");
                let mut registry = self.lock();
                if let Some(pending) = registry.pending.get_mut(&id)
                    && pending.generation == generation
                    && pending.state == RequestState::Sent
                {
                    pending.state = RequestState::WaitingForReady;
                }
            }
            Err(e) => {
                tracing::warn!(
                    request_id = id,
                    msg_type = %message.msg_type,
                    "Request rejected: {e}"
                );
                self.finish(id, Err(RequestError::Engine(e)));
            }
        }
    }

    fn arm_timeout(&self, id: u32, generation: u64, scope: CancellationToken) {
        let deadline = self.config.request_timeout;
        if deadline.is_zero() {
            return;
        }
        let engine = self.me.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    if let Some(engine) = engine.upgrade() {
                        engine.expire(id, generation);
                    }
                }
            }
        });
    }

    fn expire(&self, id: u32, generation: u64) {
        let expired = {
            let registry = self.lock();
            registry.pending.get(&id).is_some_and(|p| {
                p.generation == generation
                    && matches!(p.state, RequestState::Sent | RequestState::WaitingForResponse)
            })
        };
        if expired {
            tracing::warn!(request_id = id, "Request timed out");
            self.finish(id, Err(RequestError::Timeout));
        }
    }

    fn schedule_retry(&self, id: u32, generation: u64, scope: CancellationToken) {
        let delay = self.config.retry_delay;
        let engine = self.me.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(engine) = engine.upgrade() {
                        let due = match engine.lock().pending.get_mut(&id) {
                            Some(p) if p.generation == generation => {
                                p.retry_pending = false;
                                true
                            }
                            _ => false,
                        };
                        if due {
                            engine.dispatch(id);
                        }
                    }
                }
            }
        });
    }

    fn finish(&self, id: u32, outcome: Result<Message, RequestError>) {
        let Some(mut pending) = self.lock().remove(id) else {
            return;
        };
        pending.state = RequestState::Completed;
        for (_, callback) in pending.subscribers {
            callback(outcome.clone());
        }
    }

    fn drain(registry: &mut Registry) -> Vec<Pending> {
        let ids: Vec<u32> = registry.pending.keys().copied().collect();
        ids.into_iter().filter_map(|id| registry.remove(id)).collect()
    }

    fn fail_all(drained: Vec<Pending>, error: RequestError) {
        for pending in drained {
            for (_, callback) in pending.subscribers {
                callback(Err(error.clone()));
            }
        }
    }
}

/// Handle to a submitted request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    engine: Weak<RequestEngine>,
    request_id: u32,
    subscriber: u64,
}

impl RequestHandle {
    fn detached(engine: Weak<RequestEngine>) -> Self {
        Self {
            engine,
            request_id: 0,
            subscriber: 0,
        }
    }

    /// Wire request id. Merged requests share one.
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Current state; `Completed` or `Disposed` once it is gone.
    pub fn state(&self) -> RequestState {
        let Some(engine) = self.engine.upgrade() else {
            return RequestState::Disposed;
        };
        let registry = engine.lock();
        match registry.pending.get(&self.request_id) {
            Some(pending) if pending.subscribers.iter().any(|(s, _)| *s == self.subscriber) => {
                pending.state
            }
            _ if registry.disposed => RequestState::Disposed,
            _ => RequestState::Completed,
        }
    }

    /// Stop waiting. This caller's callback fires with `Cancelled`; other
    /// merged callers are unaffected.
    pub fn cancel(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.cancel(self.request_id, self.subscriber);
        }
    }
}

impl std::fmt::Debug for RequestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEngine")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}
