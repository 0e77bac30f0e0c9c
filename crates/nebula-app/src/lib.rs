//! The `nebula-link` command-line probe.
//!
//! Loads configuration, starts logging, opens a session over the configured
//! channels, sends one request and prints lifecycle events.

pub mod platform;
pub mod probe;
