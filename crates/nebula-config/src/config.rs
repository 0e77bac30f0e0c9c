//! Configuration structs with sensible defaults and RON persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transports, endpoints and wire settings.
    pub network: NetworkConfig,
    /// Heartbeat and request settings.
    pub session: SessionConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Transport family of a configured channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Reliable datagram (ARQ over UDP).
    Datagram,
    /// Persistent framed TCP socket.
    Socket,
    /// HTTP request/response polling.
    Poll,
}

/// One endpoint address.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointConfig {
    /// Host name, IP address, or (poll only) a full `http://` URL.
    pub address: String,
    /// Port, if not part of the address.
    pub port: Option<u16>,
}

impl EndpointConfig {
    /// Create an endpoint.
    pub fn new(address: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse a command-line endpoint: a URL is kept whole, otherwise a
    /// trailing `:port` is split off.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.contains("://") {
            return Self::new(text, None);
        }
        match text.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.ends_with(':') => match port.parse() {
                Ok(port) => Self::new(host, Some(port)),
                Err(_) => Self::new(text, None),
            },
            _ => Self::new(text, None),
        }
    }
}

/// One channel candidate: a transport kind and its ordered endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    /// Transport kind.
    pub kind: TransportKind,
    /// Endpoints tried in rotation.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Channel candidates in failover order.
    pub channels: Vec<ChannelConfig>,
    /// Payloads at least this many bytes are compressed.
    pub compression_threshold: usize,
    /// Set to false to never compress outgoing payloads.
    pub compression_enabled: bool,
    /// Transport connect deadline in milliseconds.
    pub connect_timeout_ms: u64,
    /// Datagram handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Idle poll interval in milliseconds (0 = disabled).
    pub poll_interval_ms: u64,
    /// Outbound queue capacity per channel, in messages.
    pub send_queue_capacity: usize,
}

/// Session-level configuration: liveness and request policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between application pings in seconds (0 = passive only).
    pub heartbeat_interval_secs: u64,
    /// Wait for inbound traffic after the send queue drains, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Wait for a pong after an explicit ping, in milliseconds.
    pub pong_timeout_ms: u64,
    /// Response timeout in seconds (0 = none).
    pub request_timeout_secs: u64,
    /// Retries for retryable error codes.
    pub retry_count: u32,
    /// Delay between retries in milliseconds.
    pub retry_delay_ms: u64,
    /// Server error codes that are retried locally.
    pub retryable_codes: Vec<String>,
    /// Message type -> payload fields that identify duplicate requests.
    pub merge_rules: HashMap<String, Vec<String>>,
    /// Message type of the login request.
    pub login_message_type: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channels: vec![ChannelConfig {
                kind: TransportKind::Socket,
                endpoints: vec![EndpointConfig::new("127.0.0.1", Some(7777))],
            }],
            compression_threshold: 13 * 1024,
            compression_enabled: true,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            poll_interval_ms: 5_000,
            send_queue_capacity: 256,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            probe_timeout_ms: 5_000,
            pong_timeout_ms: 5_000,
            request_timeout_secs: 30,
            retry_count: 3,
            retry_delay_ms: 1_000,
            retryable_codes: vec!["ServiceUnavailable".to_string()],
            merge_rules: HashMap::new(),
            login_message_type: "user.login".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).map_err(ConfigError::read(&config_path))?;
            let config: Config =
                ron::from_str(&contents).map_err(ConfigError::parse(&config_path))?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join("config.ron");
        std::fs::create_dir_all(config_dir).map_err(ConfigError::write(config_dir))?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(4)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::serialize(&config_path))?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::write(&config_path))?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents =
            std::fs::read_to_string(&config_path).map_err(ConfigError::read(&config_path))?;
        let new_config: Config =
            ron::from_str(&contents).map_err(ConfigError::parse(&config_path))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Platform config directory for this client (`<config_dir>/nebula-link`).
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("nebula-link"))
    }

    /// Endpoints configured for `kind` across all channel entries.
    pub fn endpoints_for(&self, kind: TransportKind) -> impl Iterator<Item = &EndpointConfig> {
        self.network
            .channels
            .iter()
            .filter(move |c| c.kind == kind)
            .flat_map(|c| c.endpoints.iter())
    }
}
