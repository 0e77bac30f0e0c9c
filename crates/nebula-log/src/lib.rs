//! Structured logging for the link client and its tools.
//!
//! Console output with uptime timestamps and module paths, plus an optional
//! JSON file for post-mortem analysis of connection sessions. The level comes
//! from `RUST_LOG` first, then the config file's `debug.log_level`.

use nebula_config::Config;
use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names a level.
pub const DEFAULT_FILTER: &str = "info,nebula_link=debug";

/// File name of the JSON session log.
pub const LOG_FILE_NAME: &str = "nebula-link.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file
/// * `json_file` - whether to write the JSON file at all
/// * `config` - optional configuration for the level override
///
/// Calling this twice panics inside `tracing_subscriber`; use
/// [`try_init_logging`] where that is possible, such as in tests.
///
/// ```no_run
/// use nebula_log::init_logging;
///
/// init_logging(Some(std::path::Path::new("./logs")), true, None);
/// ```
pub fn init_logging(log_dir: Option<&Path>, json_file: bool, config: Option<&Config>) {
    if let Err(e) = try_init_logging(log_dir, json_file, config) {
        eprintln!("logging already initialized: {e}");
    }
}

/// Like [`init_logging`] but reports an already-installed subscriber.
pub fn try_init_logging(
    log_dir: Option<&Path>,
    json_file: bool,
    config: Option<&Config>,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter_str = filter_for(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if json_file
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        return subscriber.with(file_layer).try_init();
    }

    subscriber.try_init()
}

/// Filter directive string for `config`, falling back to [`DEFAULT_FILTER`].
pub fn filter_for(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.clone()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// An `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("nebula_link=debug"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_filter_from_config() {
        let mut config = Config::default();
        config.debug.log_level = "warn,nebula_link=trace".to_string();
        assert_eq!(filter_for(Some(&config)), "warn,nebula_link=trace");
    }

    #[test]
    fn test_blank_config_level_uses_default() {
        let mut config = Config::default();
        config.debug.log_level = "  ".to_string();
        assert_eq!(filter_for(Some(&config)), DEFAULT_FILTER);
        assert_eq!(filter_for(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        let valid_filters = [
            "info",
            "debug,nebula_link::channel=trace",
            "warn,nebula_link::request=debug,nebula_link::heartbeat=trace",
            "error",
        ];

        for filter_str in &valid_filters {
            let result = EnvFilter::try_from(*filter_str);
            assert!(result.is_ok(), "Failed to parse filter: {}", filter_str);
        }
    }

    #[test]
    fn test_json_file_written() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs");

        // Another test binary thread may already own the global subscriber.
        if try_init_logging(Some(&log_dir), true, None).is_ok() {
            tracing::info!(target: "nebula_link", attempt = 1, "socket opened");
            let text = std::fs::read_to_string(log_dir.join(LOG_FILE_NAME)).unwrap();
            let line = text.lines().next().unwrap();
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["fields"]["message"], "socket opened");
            assert_eq!(value["fields"]["attempt"], 1);
        }
    }
}
