//! The binary entry point for the nebula-link probe.

use clap::Parser;
use nebula_app::probe::{self, ProbeArgs};

#[tokio::main]
async fn main() {
    let args = ProbeArgs::parse();

    let (dirs, config) = match probe::prepare(&args.client) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("Failed to initialize: {e}");
            std::process::exit(1);
        }
    };

    nebula_log::init_logging(Some(&dirs.log_dir), cfg!(debug_assertions), Some(&config));
    tracing::info!(config = %dirs.config_dir.display(), "nebula-link probe starting");

    if let Err(e) = probe::run(&args, &dirs, &config).await {
        eprintln!("Probe failed: {e}");
        std::process::exit(1);
    }
}
