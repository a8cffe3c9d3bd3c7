//! Component I: the load driver. Spins up `N` [`GameClient`]s against a
//! shared target configuration, staggers their connects across a ramp-up
//! window, drives each connected client to emit actions at a target
//! per-client rate for a bounded duration, then collects aggregate
//! counters.
//!
//! Staggered connects and paced per-client action emission, generalized
//! here from "N simulated chip readers" to "N simulated game clients".

use std::time::Duration;

use client_engine::{ClientConfig, GameClient};
use serde::Serialize;
use tracing::warn;

/// Shared configuration for one load run. Every client gets a clone of
/// `base_config` with `device_id` overwritten to `"{device_id_prefix}-{i}"`
/// so the server sees distinct devices.
#[derive(Debug, Clone)]
pub struct LoadDriverConfig {
    pub client_count: usize,
    pub base_config: ClientConfig,
    pub device_id_prefix: String,
    /// Connects are spread evenly across this window rather than fired all
    /// at once, avoiding a thundering-herd handshake burst against the
    /// server under test.
    pub ramp_up: Duration,
    /// Target actions/second each connected client sends. `0.0` means a
    /// client connects and idles (heartbeats only) for `run_duration`.
    pub action_rate_per_client: f64,
    pub action_kind: String,
    /// How long each connected client stays up and drives actions before
    /// closing.
    pub run_duration: Duration,
}

/// Aggregate counters across every client in a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub requested_clients: usize,
    pub connected_clients: usize,
    pub failed_to_connect: usize,
    pub total_actions_sent: u64,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_reconnects: u64,
    pub total_dedup_drops: u64,
}

struct ClientOutcome {
    actions_sent: u64,
    messages_sent: u64,
    messages_received: u64,
    reconnects: u64,
    dedup_drops: u64,
}

/// Runs a load scenario. Stateless: all state lives on the spawned client
/// tasks for the duration of [`LoadDriver::run`].
pub struct LoadDriver;

impl LoadDriver {
    /// Fan out `config.client_count` clients, connect them on a staggered
    /// schedule, drive each for `config.run_duration`, and return the
    /// aggregate. A client that fails to connect is logged and excluded
    /// from the aggregate; the run continues for the rest of the fleet,
    /// per §4.9's failure semantics.
    pub async fn run(config: LoadDriverConfig) -> LoadReport {
        let stagger = if config.client_count > 0 {
            config.ramp_up / config.client_count as u32
        } else {
            Duration::ZERO
        };

        let mut tasks = Vec::with_capacity(config.client_count);
        for i in 0..config.client_count {
            let mut client_config = config.base_config.clone();
            client_config.device_id = format!("{}-{i}", config.device_id_prefix);
            let delay = stagger * i as u32;
            let action_kind = config.action_kind.clone();
            let rate = config.action_rate_per_client;
            let run_duration = config.run_duration;
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                drive_one_client(client_config, action_kind, rate, run_duration).await
            }));
        }

        let mut report = LoadReport {
            requested_clients: config.client_count,
            ..Default::default()
        };
        for task in tasks {
            match task.await {
                Ok(Some(outcome)) => {
                    report.connected_clients += 1;
                    report.total_actions_sent += outcome.actions_sent;
                    report.total_messages_sent += outcome.messages_sent;
                    report.total_messages_received += outcome.messages_received;
                    report.total_reconnects += outcome.reconnects;
                    report.total_dedup_drops += outcome.dedup_drops;
                }
                Ok(None) => report.failed_to_connect += 1,
                Err(e) => {
                    warn!(error = %e, "client task panicked, excluding from aggregate");
                    report.failed_to_connect += 1;
                }
            }
        }
        report
    }
}

async fn drive_one_client(
    config: ClientConfig,
    action_kind: String,
    rate: f64,
    run_duration: Duration,
) -> Option<ClientOutcome> {
    let client = match GameClient::connect(config).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "client failed to connect, excluding from aggregate");
            return None;
        }
    };

    let deadline = tokio::time::Instant::now() + run_duration;
    let mut actions_sent = 0u64;

    if rate > 0.0 {
        let period = Duration::from_secs_f64(1.0 / rate);
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if client
                        .send_action(action_kind.clone(), serde_json::Value::Null)
                        .await
                        .is_ok()
                    {
                        actions_sent += 1;
                    }
                }
                () = tokio::time::sleep_until(deadline) => break,
            }
        }
    } else {
        tokio::time::sleep_until(deadline).await;
    }

    let stats = client.stats();
    client.close().await;

    Some(ClientOutcome {
        actions_sent,
        messages_sent: stats.messages_sent,
        messages_received: stats.messages_received,
        reconnects: stats.reconnect_count,
        dedup_drops: stats.dedup_drops,
    })
}
