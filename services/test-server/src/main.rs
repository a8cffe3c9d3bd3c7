use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use test_server::{ServerConfig, TestServer};

/// A standalone instance of the game-protocol test server.
#[derive(Debug, Parser)]
#[command(name = "test-server", version, about = "Real-time game protocol test server")]
struct Cli {
    /// Address to bind the WebSocket listener to.
    #[arg(long, default_value = "0.0.0.0:18080")]
    bind_addr: String,
    /// Maximum number of concurrently accepted connections.
    #[arg(long, default_value_t = 1000)]
    max_connections: usize,
    /// Period, in milliseconds, of the shared business-push ticker.
    #[arg(long, default_value_t = 1000)]
    push_interval_ms: u64,
    /// Connections idle this many milliseconds are closed.
    #[arg(long, default_value_t = 60_000)]
    idle_timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ServerConfig {
        bind_addr: cli.bind_addr,
        max_connections: cli.max_connections,
        push_interval: Duration::from_millis(cli.push_interval_ms),
        idle_timeout: Duration::from_millis(cli.idle_timeout_ms),
        ..ServerConfig::default()
    };

    let server = TestServer::start(config)
        .await
        .expect("failed to bind test server");
    info!(addr = %server.ws_url(), "test server ready");

    shutdown_signal().await;
    info!("shutting down");
    server.shutdown(Duration::from_secs(5)).await;
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C"); },
        _ = terminate => { info!("received SIGTERM"); },
    }
}
