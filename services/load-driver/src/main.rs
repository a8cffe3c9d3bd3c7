use std::time::Duration;

use clap::Parser;
use client_engine::ClientConfig;
use load_driver::{LoadDriver, LoadDriverConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drives a fleet of simulated game clients against a test server and
/// reports aggregate throughput and reliability counters.
#[derive(Debug, Parser)]
#[command(name = "load-driver", version, about = "Game protocol load driver")]
struct Cli {
    /// WebSocket URL of the server under test.
    #[arg(long)]
    server_url: String,
    /// Shared auth token presented by every simulated client.
    #[arg(long, default_value = "load-test-token")]
    token: String,
    /// Number of concurrent simulated clients.
    #[arg(long, default_value_t = 100)]
    clients: usize,
    /// Window, in milliseconds, over which client connects are staggered.
    #[arg(long, default_value_t = 5_000)]
    ramp_up_ms: u64,
    /// Target actions/second sent by each connected client.
    #[arg(long, default_value_t = 1.0)]
    action_rate: f64,
    /// Action kind string sent in every simulated action.
    #[arg(long, default_value = "move")]
    action_kind: String,
    /// How long, in seconds, each connected client drives actions before
    /// closing.
    #[arg(long, default_value_t = 30)]
    run_seconds: u64,
    /// Heartbeat ping interval, in milliseconds.
    #[arg(long, default_value_t = 15_000)]
    heartbeat_interval_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let base_config = ClientConfig {
        server_url: cli.server_url.clone(),
        token: cli.token,
        heartbeat_interval: Duration::from_millis(cli.heartbeat_interval_ms),
        ..ClientConfig::default()
    };

    info!(
        server_url = %cli.server_url,
        clients = cli.clients,
        action_rate = cli.action_rate,
        run_seconds = cli.run_seconds,
        "starting load run"
    );

    let report = LoadDriver::run(LoadDriverConfig {
        client_count: cli.clients,
        base_config,
        device_id_prefix: "load-driver".to_owned(),
        ramp_up: Duration::from_millis(cli.ramp_up_ms),
        action_rate_per_client: cli.action_rate,
        action_kind: cli.action_kind,
        run_duration: Duration::from_secs(cli.run_seconds),
    })
    .await;

    info!("load run complete");
    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("report serializes")
    );
}
