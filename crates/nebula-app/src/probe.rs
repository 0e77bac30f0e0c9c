//! One probe run: connect, issue a request, report what happened.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nebula_config::{CliArgs, Config, ConfigError};
use nebula_link::{
    Client, ClientContext, ClientEvent, EncodeError, FileEndpointStore, LinkConfig, Payload,
    TransportInfo,
};
use tokio::sync::broadcast::error::RecvError;

use crate::platform::{PlatformError, ProbeDirs};

/// Probe arguments: the shared client flags plus what to send.
#[derive(Parser, Debug)]
#[command(name = "nebula-link", about = "Game-backend session probe")]
pub struct ProbeArgs {
    #[command(flatten)]
    pub client: CliArgs,

    /// Message type of the probe request.
    #[arg(long, default_value = "sys.echo")]
    pub request: String,

    /// Seconds to wait for an authenticated session.
    #[arg(long, default_value_t = 15)]
    pub wait: u64,
}

#[derive(Debug)]
pub enum ProbeError {
    Platform(PlatformError),
    Config(ConfigError),
    Encode(EncodeError),
    /// No session within the wait window, or every transport failed.
    NotConnected,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Platform(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Encode(e) => write!(f, "handshake encoding failed: {e}"),
            Self::NotConnected => write!(f, "no session could be established"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Load config, apply CLI overrides and create directories.
pub fn prepare(args: &CliArgs) -> Result<(ProbeDirs, Config), ProbeError> {
    let dirs = ProbeDirs::resolve(args.config.as_deref()).map_err(ProbeError::Platform)?;
    dirs.create_dirs().map_err(ProbeError::Platform)?;
    let mut config = Config::load_or_create(&dirs.config_dir).map_err(ProbeError::Config)?;
    config.apply_cli_overrides(args);
    Ok((dirs, config))
}

/// Run a probe against the configured channels.
pub async fn run(args: &ProbeArgs, dirs: &ProbeDirs, config: &Config) -> Result<(), ProbeError> {
    let link = LinkConfig::from_config(config);
    let ctx = ClientContext::new(link)
        .with_store(Arc::new(FileEndpointStore::open(dirs.state_dir.clone())));
    let client = Client::new(ctx).map_err(ProbeError::Encode)?;

    let mut events = client.subscribe();
    client.start();

    let wait = Duration::from_secs(args.wait);
    let authenticated = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    print_event(&event);
                    match event {
                        ClientEvent::Authenticated => return true,
                        ClientEvent::ConnectionClosed(_) => return false,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Probe fell behind on events")
                }
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if !authenticated {
        println!("state: {:?}", client.state());
        if let Some(info) = client.last_transport_info() {
            print_info("last attempt", &info);
        }
        client.dispose();
        return Err(ProbeError::NotConnected);
    }

    let payload = Payload::new().with("probe", "nebula-link");
    match client.request(args.request.clone(), payload).await {
        Ok(response) => println!("response: {} {:?}", response.msg_type, response.payload),
        Err(e) => println!("request failed: {e}"),
    }

    let diagnostics = client.diagnostics();
    println!(
        "diagnostics: rtt={:?} jitter={:?} loss={:.1}% samples={}",
        diagnostics.average_rtt,
        diagnostics.jitter,
        diagnostics.loss_rate * 100.0,
        diagnostics.sample_count
    );

    println!("state: {:?}", client.state());
    client.dispose();
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Attempting { kind, endpoint } => println!("attempting {kind} {endpoint}"),
        ClientEvent::ConnectionOpened(info) => print_info("opened", info),
        ClientEvent::ConnectionDisrupted(info) => print_info("disrupted", info),
        ClientEvent::ConnectionClosed(Some(info)) => print_info("closed", info),
        ClientEvent::ConnectionClosed(None) => println!("closed: no transport was attempted"),
        ClientEvent::Authenticated => println!("authenticated"),
        ClientEvent::MessageReceived(msg) => println!("message: {}", msg.msg_type),
    }
}

fn print_info(label: &str, info: &TransportInfo) {
    println!(
        "{label}: #{} {} {} connect={:?} handshake={:?} sent={}B/{} recv={}B/{}{}",
        info.attempt,
        info.kind,
        info.endpoint,
        info.connect_latency,
        info.handshake_latency,
        info.traffic.bytes_sent,
        info.traffic.messages_sent,
        info.traffic.bytes_received,
        info.traffic.messages_received,
        info.close_reason
            .as_deref()
            .map(|r| format!(" reason={r}"))
            .unwrap_or_default(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_args_flatten_client_flags() {
        let args = ProbeArgs::parse_from([
            "nebula-link",
            "--socket",
            "127.0.0.1:7000",
            "--poll",
            "http://127.0.0.1:8080/poll",
            "--request",
            "game.status",
        ]);
        assert_eq!(args.client.socket, vec!["127.0.0.1:7000".to_string()]);
        assert_eq!(args.client.poll.len(), 1);
        assert_eq!(args.request, "game.status");
        assert_eq!(args.wait, 15);
    }

    #[test]
    fn test_prepare_writes_default_config() {
        let tmp = tempfile::tempdir().unwrap();
        let args = CliArgs {
            config: Some(tmp.path().to_path_buf()),
            heartbeat_interval: Some(5),
            ..CliArgs::default()
        };
        let (dirs, config) = prepare(&args).unwrap();
        assert!(dirs.config_dir.join("config.ron").exists());
        assert_eq!(config.session.heartbeat_interval_secs, 5);
    }

    #[tokio::test]
    async fn test_run_fails_without_server() {
        let tmp = tempfile::tempdir().unwrap();
        // Grab a free port and release it so nothing is listening there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let args = ProbeArgs::parse_from([
            "nebula-link".to_string(),
            "--config".to_string(),
            tmp.path().display().to_string(),
            "--socket".to_string(),
            format!("127.0.0.1:{port}"),
            "--wait".to_string(),
            "5".to_string(),
        ]);
        let (dirs, config) = prepare(&args.client).unwrap();
        let result = run(&args, &dirs, &config).await;
        assert!(matches!(result, Err(ProbeError::NotConnected)));
    }
}
