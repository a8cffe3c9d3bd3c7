//! End-to-end scenarios driving a real [`TestServer`] with real
//! [`GameClient`]s, covering `spec.md` §8's concrete scenarios 1-5 and
//! universal invariants 3 and 8.

use std::time::Duration;

use client_engine::{ClientConfig, ClientObserver, ClientState};
use test_server::{ServerConfig, TestServer};

fn client_config(url: String, token: &str) -> ClientConfig {
    ClientConfig {
        server_url: url,
        token: token.to_owned(),
        client_version: "1.0.0".to_owned(),
        device_id: format!("device-{token}"),
        heartbeat_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_millis(150),
        max_in_flight_pings: 3,
        reconnect_initial_interval: Duration::from_millis(50),
        reconnect_max_interval: Duration::from_millis(200),
        reconnect_multiplier: 2.0,
        handshake_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

async fn wait_for_state(client: &client_engine::GameClient, target: ClientState, timeout: Duration) {
    let mut rx = client.state_rx();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if *rx.borrow() == target {
            return;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(remaining > Duration::ZERO, "timed out waiting for {target:?}");
        tokio::time::timeout(remaining, rx.changed())
            .await
            .expect("state change before deadline")
            .expect("state channel open");
    }
}

/// Scenario 1: basic roundtrip.
#[tokio::test]
async fn basic_roundtrip_reports_connection_counts() {
    let server = TestServer::start(ServerConfig::default())
        .await
        .expect("bind server");
    let url = server.ws_url();

    let client = client_engine::GameClient::connect(client_config(url, "t1"))
        .await
        .expect("connect");
    wait_for_state(&client, ClientState::Connected, Duration::from_secs(2)).await;

    let stats = server.get_stats();
    assert_eq!(stats.current_connections, 1);
    assert_eq!(stats.total_connections, 1);

    client.close().await;
    // Give the server a moment to observe the peer close.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = server.get_stats();
    assert_eq!(stats.current_connections, 0);
    assert_eq!(stats.total_connections, 1);

    server.shutdown(Duration::from_secs(1)).await;
}

struct SeqCollector {
    seqs: std::sync::Arc<std::sync::Mutex<Vec<u64>>>,
}

impl ClientObserver for SeqCollector {
    fn on_push_state(&mut self, push: &proto::PushState) {
        self.seqs.lock().unwrap().push(push.seq);
    }
}

/// Scenario 2 / invariant 3 / invariant 8: push sequence numbers are
/// strictly monotone across a forced server-side disconnect and the
/// client's subsequent reconnect, and the server's global push counter
/// never resets.
#[tokio::test]
async fn push_sequence_is_monotone_across_forced_reconnect() {
    let server = TestServer::start(ServerConfig {
        push_interval: Duration::from_millis(50),
        ..ServerConfig::default()
    })
    .await
    .expect("bind server");
    let url = server.ws_url();

    let client = client_engine::GameClient::connect(client_config(url, "t2"))
        .await
        .expect("connect");
    wait_for_state(&client, ClientState::Connected, Duration::from_secs(2)).await;

    let seqs = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    client.register_observer(Box::new(SeqCollector { seqs: seqs.clone() }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        seqs.lock().unwrap().len() >= 3,
        "expected at least 3 pushes before the disconnect"
    );

    server.disconnect_all().await;
    wait_for_state(&client, ClientState::Connected, Duration::from_secs(2)).await;

    tokio::time::sleep(Duration::from_secs(1)).await;

    let observed = seqs.lock().unwrap().clone();
    for pair in observed.windows(2) {
        assert!(
            pair[1] > pair[0],
            "push sequence must be strictly increasing across reconnect: {observed:?}"
        );
    }

    let stats = server.get_stats();
    assert!(stats.total_connections >= 2, "client must have reconnected at least once");

    client.close().await;
    server.shutdown(Duration::from_secs(1)).await;
}

/// Scenario 3: heartbeat RTT distribution.
#[tokio::test]
async fn heartbeat_produces_several_small_rtt_samples() {
    let server = TestServer::start(ServerConfig::default())
        .await
        .expect("bind server");
    let url = server.ws_url();

    let mut cfg = client_config(url, "t3");
    cfg.heartbeat_interval = Duration::from_millis(200);
    let client = client_engine::GameClient::connect(cfg).await.expect("connect");
    wait_for_state(&client, ClientState::Connected, Duration::from_secs(2)).await;

    tokio::time::sleep(Duration::from_secs(1)).await;

    let stats = client.stats();
    let rtt = stats.last_rtt().expect("at least one RTT sample recorded");
    assert!(rtt < Duration::from_secs(1), "RTT on loopback should be well under 1s");

    client.close().await;
    server.shutdown(Duration::from_secs(1)).await;
}

/// Scenario 4: concurrent clients.
#[tokio::test]
async fn ten_concurrent_clients_all_connect_and_send_actions() {
    let server = TestServer::start(ServerConfig {
        max_connections: 50,
        ..ServerConfig::default()
    })
    .await
    .expect("bind server");
    let url = server.ws_url();

    let mut handles = Vec::new();
    for i in 0..10 {
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let client = client_engine::GameClient::connect(client_config(url, &format!("c{i}")))
                .await
                .expect("connect");
            wait_for_state(&client, ClientState::Connected, Duration::from_secs(2)).await;
            client
                .send_action("move", serde_json::json!({"dx": 1}))
                .await
                .expect("send action");
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            client.close().await;
        }));
    }
    for h in handles {
        h.await.expect("client task");
    }

    let stats = server.get_stats();
    assert_eq!(stats.current_connections, 0);
    assert_eq!(stats.total_connections, 10);
    assert!(stats.total_messages_in >= 10);

    server.shutdown(Duration::from_secs(1)).await;
}

/// Scenario 5: a 64 KiB action payload is carried intact; the decoder
/// never rejects a large-but-legal frame.
#[tokio::test]
async fn large_action_payload_is_received_intact() {
    let server = TestServer::start(ServerConfig::default())
        .await
        .expect("bind server");
    let url = server.ws_url();

    let client = client_engine::GameClient::connect(client_config(url, "t5"))
        .await
        .expect("connect");
    wait_for_state(&client, ClientState::Connected, Duration::from_secs(2)).await;

    let big = "x".repeat(65_536);
    client
        .send_action("upload", serde_json::json!({ "blob": big }))
        .await
        .expect("send large action");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = server.get_stats();
    assert!(stats.total_messages_in >= 1);

    client.close().await;
    server.shutdown(Duration::from_secs(1)).await;
}
