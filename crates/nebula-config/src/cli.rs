//! Command-line argument parsing for the nebula-link probe.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{ChannelConfig, EndpointConfig, TransportKind};
use crate::Config;

/// nebula-link command-line arguments.
///
/// CLI values override settings loaded from `config.ron`. Any endpoint flag
/// replaces the configured channel list; channels are then tried in the
/// order datagram, socket, poll.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-link", about = "Game-backend session probe")]
pub struct CliArgs {
    /// Socket endpoint (`host:port`). Repeatable.
    #[arg(long)]
    pub socket: Vec<String>,

    /// Datagram endpoint (`host:port`). Repeatable.
    #[arg(long)]
    pub datagram: Vec<String>,

    /// Poll endpoint (`host:port` or URL). Repeatable.
    #[arg(long)]
    pub poll: Vec<String>,

    /// Compression threshold in bytes.
    #[arg(long)]
    pub compression_threshold: Option<usize>,

    /// Heartbeat interval in seconds.
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let overrides = [
            (TransportKind::Datagram, &args.datagram),
            (TransportKind::Socket, &args.socket),
            (TransportKind::Poll, &args.poll),
        ];
        if overrides.iter().any(|(_, list)| !list.is_empty()) {
            self.network.channels = overrides
                .iter()
                .filter(|(_, list)| !list.is_empty())
                .map(|(kind, list)| ChannelConfig {
                    kind: *kind,
                    endpoints: list.iter().map(|e| EndpointConfig::parse(e)).collect(),
                })
                .collect();
        }
        if let Some(threshold) = args.compression_threshold {
            self.network.compression_threshold = threshold;
        }
        if let Some(secs) = args.heartbeat_interval {
            self.session.heartbeat_interval_secs = secs;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
