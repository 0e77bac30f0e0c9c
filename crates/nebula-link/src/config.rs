//! Runtime settings for the client, built from [`nebula_config::Config`].

use std::time::Duration;

use nebula_config::{Config, TransportKind};

use crate::channel::{ChannelKind, ChannelSettings, Endpoint};
use crate::codec::CodecConfig;
use crate::diagnostics::DiagnosticsConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::request::RequestConfig;

/// One channel candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntryConfig {
    pub kind: ChannelKind,
    pub endpoints: Vec<Endpoint>,
}

impl ChannelEntryConfig {
    /// Entry of `kind` over `(address, port)` pairs.
    pub fn new<'a>(
        kind: ChannelKind,
        endpoints: impl IntoIterator<Item = (&'a str, Option<u16>)>,
    ) -> Self {
        Self {
            kind,
            endpoints: endpoints
                .into_iter()
                .map(|(address, port)| Endpoint::new(kind, address, port))
                .collect(),
        }
    }
}

/// Everything the engine needs, with documented defaults per sub-config.
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// Candidates in failover order.
    pub channels: Vec<ChannelEntryConfig>,
    pub codec: CodecConfig,
    pub channel: ChannelSettings,
    pub heartbeat: HeartbeatConfig,
    pub requests: RequestConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl LinkConfig {
    /// Convert the on-disk configuration.
    pub fn from_config(config: &Config) -> Self {
        let network = &config.network;
        let session = &config.session;

        let channels = network
            .channels
            .iter()
            .map(|c| {
                let kind = channel_kind(c.kind);
                ChannelEntryConfig {
                    kind,
                    endpoints: c
                        .endpoints
                        .iter()
                        .map(|e| Endpoint::new(kind, e.address.clone(), e.port))
                        .collect(),
                }
            })
            .collect();

        let mut codec = CodecConfig::default();
        codec.compression.threshold = network.compression_threshold;
        codec.compression.enabled = network.compression_enabled;

        let channel = ChannelSettings {
            connect_timeout: Duration::from_millis(network.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(network.handshake_timeout_ms),
            poll_interval: Duration::from_millis(network.poll_interval_ms),
            send_queue_capacity: network.send_queue_capacity,
            ..ChannelSettings::default()
        };

        let heartbeat = HeartbeatConfig {
            interval: Duration::from_secs(session.heartbeat_interval_secs),
            probe_timeout: Duration::from_millis(session.probe_timeout_ms),
            pong_timeout: Duration::from_millis(session.pong_timeout_ms),
            ..HeartbeatConfig::default()
        };

        let requests = RequestConfig {
            retryable_codes: session.retryable_codes.clone(),
            retry_count: session.retry_count,
            retry_delay: Duration::from_millis(session.retry_delay_ms),
            request_timeout: Duration::from_secs(session.request_timeout_secs),
            merge_rules: session.merge_rules.clone(),
            login_type: session.login_message_type.clone(),
        };

        Self {
            channels,
            codec,
            channel,
            heartbeat,
            requests,
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

fn channel_kind(kind: TransportKind) -> ChannelKind {
    match kind {
        TransportKind::Datagram => ChannelKind::Datagram,
        TransportKind::Socket => ChannelKind::Socket,
        TransportKind::Poll => ChannelKind::Poll,
    }
}
