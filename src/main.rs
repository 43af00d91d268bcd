//! Main entry point for the burrow binary.
//!
//! Opens a loopback TCP port that tunnels to a remote instance port
//! through a relay service: parses arguments and environment, wires the
//! credential source and target resolver into the WebSocket relay factory,
//! asks the broker for a tunnel and keeps it open until ctrl-c.

use crate::error::{AppError, AppErrorKind};
use burrow_core::policy::{AllowAll, LoopbackOnly, RelayPolicy};
use burrow_core::target::{RelayEndpoint, StaticCredential, StaticResolver, TunnelDestination};
use burrow_relay::connection::RelayLimits;
use burrow_relay::ws::WsRelayFactory;
use burrow_tunnel::broker::TunnelBroker;
use burrow_tunnel::listener::TunnelEvent;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

mod error;

#[derive(Debug, Parser, Default)]
struct PreCli {
    /// Optional `.env` file path for loading environment variables.
    #[clap(short, long, value_name = "ENV_FILE")]
    env_file: Option<String>,
}

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Relay host to connect through, e.g. relay.example.com.
    #[clap(short = 'r', long, value_name = "RELAY_HOST", env = "BURROW_RELAY_HOST")]
    relay_host: String,

    /// Relay port to connect through.
    #[clap(
        long,
        value_name = "RELAY_PORT",
        env = "BURROW_RELAY_PORT",
        default_value = "443"
    )]
    relay_port: u16,

    /// Optional `.env` file path for loading environment variables.
    #[clap(short, long, value_name = "ENV_FILE")]
    env_file: Option<String>,

    /// Do not use TLS for the relay connection.
    #[clap(
        short = 'n',
        long,
        value_name = "NO_TLS",
        env = "BURROW_NO_TLS",
        action = clap::ArgAction::SetTrue,
    )]
    no_tls: bool,

    /// Project the target instance lives in.
    #[clap(long, value_name = "PROJECT", env = "BURROW_PROJECT")]
    project: String,

    /// Zone the target instance lives in.
    #[clap(long, value_name = "ZONE", env = "BURROW_ZONE")]
    zone: String,

    /// Name of the target instance.
    #[clap(short = 'i', long, value_name = "INSTANCE", env = "BURROW_INSTANCE")]
    instance: String,

    /// Port on the target instance, e.g. 22 or 3389.
    #[clap(
        short = 'p',
        long,
        value_name = "TARGET_PORT",
        env = "BURROW_TARGET_PORT",
        default_value = "22"
    )]
    target_port: u16,

    /// Local loopback port to listen on; 0 picks an ephemeral port.
    #[clap(
        short = 'l',
        long,
        value_name = "LOCAL_PORT",
        env = "BURROW_LOCAL_PORT",
        default_value = "0"
    )]
    local_port: u16,

    /// Bearer token presented to the relay.
    #[clap(short = 't', long, value_name = "ACCESS_TOKEN", env = "BURROW_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// File to read the bearer token from instead of the environment.
    #[clap(long, value_name = "ACCESS_TOKEN_FILE", env = "BURROW_ACCESS_TOKEN_FILE")]
    access_token_file: Option<String>,

    /// Admit connections from any local address, not only loopback peers.
    #[clap(
        long,
        value_name = "ALLOW_ALL",
        env = "BURROW_ALLOW_ALL",
        action = clap::ArgAction::SetTrue,
    )]
    allow_all: bool,

    /// Tunnel setup timeout in seconds.
    #[clap(
        long,
        value_name = "CONNECT_TIMEOUT",
        env = "BURROW_CONNECT_TIMEOUT",
        default_value = "30"
    )]
    connect_timeout: u64,

    /// Retries for the initial tunnel setup.
    #[clap(
        long,
        value_name = "SETUP_RETRIES",
        env = "BURROW_SETUP_RETRIES",
        default_value = "2"
    )]
    setup_retries: usize,

    /// Retry interval in seconds between setup attempts.
    #[clap(
        long,
        value_name = "RETRY_INTERVAL",
        env = "BURROW_RETRY_INTERVAL",
        default_value = "1"
    )]
    retry_interval: u64,

    /// Resume attempts before a dropped relay stream is considered lost.
    #[clap(
        long,
        value_name = "MAX_RECONNECTS",
        env = "BURROW_MAX_RECONNECTS",
        default_value = "2"
    )]
    max_reconnects: usize,

    /// Optional log level.
    #[clap(
        long,
        value_name = "LOG_LEVEL",
        env = "BURROW_LOG_LEVEL",
        default_value = "info"
    )]
    log_level: String,
}

fn read_access_token(cli: &Cli) -> Result<String, AppError> {
    if let Some(token) = &cli.access_token {
        return Ok(token.clone());
    }
    if let Some(path) = &cli.access_token_file {
        let token = std::fs::read_to_string(path)?;
        return Ok(token.trim().to_owned());
    }
    Err(AppError::new(
        AppErrorKind::ArgumentError,
        "an access token is required (--access-token or --access-token-file)",
    ))
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let pre = PreCli::try_parse().unwrap_or_default();
    if let Some(env_file) = pre.env_file {
        dotenvy::from_filename(env_file).expect("failed to load .env file");
    } else {
        dotenvy::dotenv().ok();
    }

    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("burrow={},info", cli.log_level)),
    )
    .init();
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let token = read_access_token(&cli)?;
    let destination = TunnelDestination::new(
        cli.project.as_str(),
        cli.zone.as_str(),
        cli.instance.as_str(),
        cli.target_port,
    );
    let endpoint = RelayEndpoint::new(cli.relay_host.as_str(), cli.relay_port, !cli.no_tls);
    info!("Tunneling {destination} through {endpoint}");

    let credentials = Arc::new(StaticCredential::new(token.as_str())?);
    let resolver = Arc::new(StaticResolver::new(endpoint));
    let factory = WsRelayFactory::new(resolver, credentials);

    let limits = RelayLimits {
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        max_reconnects: cli.max_reconnects,
        ..RelayLimits::default()
    };
    let (broker, mut events) = TunnelBroker::new(factory, limits);

    let policy: Arc<dyn RelayPolicy> = if cli.allow_all {
        Arc::new(AllowAll)
    } else {
        Arc::new(LoopbackOnly)
    };

    let handle = burrow_core::retry!(
        broker
            .connect(
                destination.clone(),
                policy.clone(),
                cli.local_port,
                Duration::from_secs(cli.connect_timeout),
            )
            .await,
        cli.setup_retries,
        Duration::from_secs(cli.retry_interval)
    )?;
    info!(
        "Tunnel ready; point your client at {}",
        handle.local_addr()
    );

    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::SessionStarted { session, peer } => {
                    info!("Session {session} started for {peer}");
                }
                TunnelEvent::SessionDenied { peer, reason } => {
                    warn!("Session for {peer} denied: {reason}");
                }
                TunnelEvent::SessionEnded { session, outcome } => {
                    info!("Session {session} ended: {outcome:?}");
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!(
        "Shutting down; {} bytes sent, {} bytes received",
        handle.bytes_sent(),
        handle.bytes_received()
    );
    broker.disconnect(&handle).await;
    broker.shutdown().await;
    event_logger.abort();
    if let Err(e) = event_logger.await {
        if !e.is_cancelled() {
            error!("Event logger failed: {e}");
        }
    }
    Ok(())
}
