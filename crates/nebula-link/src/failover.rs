//! Channel and endpoint selection for the connection orchestrator.
//!
//! Pure state, no IO: the orchestrator reports what happened to the current
//! attempt and gets back the next [`Step`].
//!
//! Each entry has a retry budget of one. When an attempt closes, the entry's
//! endpoint index always advances. If the budget is left, it is spent and the
//! same entry is retried at its new endpoint, otherwise the next entry is
//! selected. Reaching `Connected` refills the budget, so an entry that
//! connected is retried once at its next endpoint before being abandoned.
//! A blank endpoint address is never attempted. Skipping it advances the
//! rotation and spends the budget the way a failed attempt would; an entry
//! that runs out of budget on a blank endpoint is disposed.

use crate::channel::{ChannelKind, Endpoint};

/// What the orchestrator should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Start an attempt on `entry` at `endpoint`.
    Connect {
        /// Entry position, also its persistence slot.
        entry: usize,
        /// Endpoint to connect to.
        endpoint: Endpoint,
    },
    /// Every entry has been tried.
    Exhausted,
}

/// One configured channel candidate.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    kind: ChannelKind,
    endpoints: Vec<Endpoint>,
    index: usize,
    retries: u8,
    connected_once: bool,
}

impl ChannelEntry {
    /// Create an entry; `index` is a restored rotation position and is
    /// reduced modulo the endpoint count.
    pub fn new(kind: ChannelKind, endpoints: Vec<Endpoint>, index: usize) -> Self {
        let index = if endpoints.is_empty() { 0 } else { index % endpoints.len() };
        Self {
            kind,
            endpoints,
            index,
            retries: 1,
            connected_once: false,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Current rotation position.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn has_connected(&self) -> bool {
        self.connected_once
    }

    fn current(&self) -> Option<&Endpoint> {
        self.endpoints.get(self.index)
    }

    fn advance(&mut self) {
        if !self.endpoints.is_empty() {
            self.index = (self.index + 1) % self.endpoints.len();
        }
    }
}

/// Failover state machine over an ordered list of entries.
#[derive(Debug, Clone)]
pub struct Failover {
    entries: Vec<ChannelEntry>,
    current: Option<usize>,
}

impl Failover {
    pub fn new(entries: Vec<ChannelEntry>) -> Self {
        Self {
            entries,
            current: None,
        }
    }

    pub fn entries(&self) -> &[ChannelEntry] {
        &self.entries
    }

    /// Entry of the attempt in progress, if any.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Start a fresh sequence from the first entry. Rotation positions are
    /// kept; budgets and connection history are reset.
    pub fn begin(&mut self) -> Step {
        for entry in &mut self.entries {
            entry.retries = 1;
            entry.connected_once = false;
        }
        self.select_from(0)
    }

    /// The current attempt reached `Connected`.
    pub fn on_connected(&mut self) {
        if let Some(entry) = self.current.and_then(|i| self.entries.get_mut(i)) {
            entry.connected_once = true;
            entry.retries = 1;
        }
    }

    /// The current attempt closed, for any reason.
    pub fn on_closed(&mut self) -> Step {
        let Some(i) = self.current else {
            return Step::Exhausted;
        };
        let entry = &mut self.entries[i];
        entry.advance();
        if entry.retries > 0 {
            entry.retries -= 1;
            tracing::debug!(
                entry = i,
                kind = %entry.kind,
                index = entry.index,
                "Retrying entry at next endpoint"
            );
            self.select_from(i)
        } else {
            tracing::debug!(entry = i, kind = %entry.kind, "Abandoning entry");
            self.select_from(i + 1)
        }
    }

    /// Stop tracking the current attempt without advancing.
    pub fn reset(&mut self) {
        self.current = None;
    }

    fn select_from(&mut self, start: usize) -> Step {
        for i in start..self.entries.len() {
            let entry = &mut self.entries[i];
            loop {
                match entry.current().map(Endpoint::is_usable) {
                    None => {
                        tracing::warn!(
                            entry = i,
                            kind = %entry.kind,
                            "Skipping entry with no endpoints"
                        );
                        break;
                    }
                    Some(true) => {
                        let endpoint = entry.endpoints[entry.index].clone();
                        self.current = Some(i);
                        return Step::Connect { entry: i, endpoint };
                    }
                    Some(false) if entry.retries > 0 => {
                        tracing::warn!(
                            entry = i,
                            kind = %entry.kind,
                            index = entry.index,
                            "Endpoint address is blank, skipping to next endpoint"
                        );
                        entry.retries -= 1;
                        entry.advance();
                    }
                    Some(false) => {
                        tracing::warn!(
                            entry = i,
                            kind = %entry.kind,
                            index = entry.index,
                            "Endpoint address is blank, disposing entry"
                        );
                        break;
                    }
                }
            }
        }
        self.current = None;
        Step::Exhausted
    }
}
