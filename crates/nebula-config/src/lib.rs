//! Configuration for the nebula-link client.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports CLI overrides via clap, hot-reload detection, forward/backward
//! compatible serialization, and persisted endpoint rotation.

mod cli;
mod config;
mod endpoint_state;
mod error;

pub use cli::CliArgs;
pub use config::{
    ChannelConfig, Config, DebugConfig, EndpointConfig, NetworkConfig, SessionConfig,
    TransportKind,
};
pub use endpoint_state::EndpointState;
pub use error::ConfigError;
