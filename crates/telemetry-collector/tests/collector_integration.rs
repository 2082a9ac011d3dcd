// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test readability
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! End-to-end collector tests over real loopback sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telemetry_collector::exporter::{self, ExporterState};
use telemetry_collector::server::FramedConnection;
use telemetry_collector::{
    GaugeRegistry, ModuleInfo, ModuleKey, Packet, ServerConfig, TelemetryClient, TelemetryServer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    server: TelemetryServer,
    registry: Arc<GaugeRegistry>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    async fn start_with(config: ServerConfig) -> Self {
        let registry = Arc::new(GaugeRegistry::new());
        let server = TelemetryServer::new(config, registry.clone()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await.unwrap() })
        };

        Self {
            server,
            registry,
            addr,
            handle,
        }
    }

    async fn stop(self) {
        self.server.shutdown();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

fn agent() -> ModuleInfo {
    ModuleInfo::new("agent", "1.0.0", "")
}

fn agent_key() -> ModuleKey {
    ModuleKey::new("agent", "1.0.0", "")
}

/// Poll until `cond` holds or the deadline passes.
async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn raw_connect(addr: SocketAddr) -> FramedConnection<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    FramedConnection::new(stream, addr, 65535)
}

#[tokio::test]
async fn test_agent_lifecycle() {
    let h = Harness::start().await;

    let mut client = TelemetryClient::connect(h.addr, vec![agent()])
        .await
        .unwrap();
    wait_for("gauge to reach 1", || h.registry.get(&agent_key()) == 1).await;

    client.heartbeat().await.unwrap();
    client.heartbeat().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.registry.get(&agent_key()), 1);

    drop(client);
    wait_for("gauge to return to 0", || h.registry.get(&agent_key()) == 0).await;
    wait_for("session to end", || h.server.active_sessions() == 0).await;

    h.stop().await;
}

#[tokio::test]
async fn test_many_connections() {
    const N: i64 = 8;
    let h = Harness::start().await;

    let mut clients = Vec::new();
    for _ in 0..N {
        clients.push(
            TelemetryClient::connect(h.addr, vec![agent()])
                .await
                .unwrap(),
        );
    }
    wait_for("gauge to reach N", || h.registry.get(&agent_key()) == N).await;

    clients.truncate(3);
    wait_for("gauge to drop to 3", || h.registry.get(&agent_key()) == 3).await;

    clients.clear();
    wait_for("gauge to return to 0", || h.registry.get(&agent_key()) == 0).await;

    h.stop().await;
}

#[tokio::test]
async fn test_multiple_modules_one_connection() {
    let h = Harness::start().await;
    let modules = vec![
        ModuleInfo::new("host", "2.1.0", "abc123"),
        ModuleInfo::new("plugin", "0.3.0", ""),
    ];

    let client = TelemetryClient::connect(h.addr, modules).await.unwrap();
    let host = ModuleKey::new("host", "2.1.0", "abc123");
    let plugin = ModuleKey::new("plugin", "0.3.0", "");
    wait_for("both gauges at 1", || {
        h.registry.get(&host) == 1 && h.registry.get(&plugin) == 1
    })
    .await;

    client.close().await.unwrap();
    wait_for("both gauges at 0", || {
        h.registry.get(&host) == 0 && h.registry.get(&plugin) == 0
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn test_unauthenticated_disconnect_leaves_gauges_alone() {
    let h = Harness::start().await;

    let mut conn = raw_connect(h.addr).await;
    conn.send_packet(&Packet::HandshakeRequest {
        modules: vec![agent()],
    })
    .await
    .unwrap();
    assert!(matches!(
        conn.read_packet().await.unwrap(),
        Some(Packet::HandshakeResponse { .. })
    ));
    drop(conn);

    wait_for("session to end", || h.server.active_sessions() == 0).await;
    assert!(h.registry.is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_forged_tag_is_not_counted() {
    let h = Harness::start().await;

    let mut conn = raw_connect(h.addr).await;
    conn.send_packet(&Packet::HandshakeRequest {
        modules: vec![agent()],
    })
    .await
    .unwrap();
    let _ = conn.read_packet().await.unwrap();

    conn.send_packet(&Packet::StartRequest { tag: [0u8; 32] })
        .await
        .unwrap();
    assert_eq!(conn.read_packet().await.unwrap(), Some(Packet::StartResponse));

    // Heartbeat on an unauthenticated session ends it.
    conn.send_packet(&Packet::HeartbeatRequest).await.unwrap();
    assert_eq!(conn.read_packet().await.unwrap(), None);
    assert_eq!(h.registry.get(&agent_key()), 0);

    h.stop().await;
}

#[tokio::test]
async fn test_protocol_violation_closes_connection() {
    let h = Harness::start().await;

    let mut conn = raw_connect(h.addr).await;
    conn.send_packet(&Packet::HeartbeatRequest).await.unwrap();
    assert_eq!(conn.read_packet().await.unwrap(), None);

    h.stop().await;
}

#[tokio::test]
async fn test_empty_frame_is_skipped() {
    let h = Harness::start().await;

    let mut conn = raw_connect(h.addr).await;
    conn.stream_mut().write_all(&[0x00, 0x00]).await.unwrap();
    conn.send_packet(&Packet::HandshakeRequest {
        modules: vec![agent()],
    })
    .await
    .unwrap();
    assert!(matches!(
        conn.read_packet().await.unwrap(),
        Some(Packet::HandshakeResponse { .. })
    ));

    h.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let config = ServerConfig {
        max_frame_size: 64,
        ..Default::default()
    };
    let h = Harness::start_with(config).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream.write_all(&[0x01, 0x00]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    h.stop().await;
}

#[tokio::test]
async fn test_unknown_module_rejected_by_allowlist() {
    let mut config = ServerConfig::default();
    config
        .known_modules
        .insert("agent".to_string(), vec!["1.0.0".to_string()]);
    let h = Harness::start_with(config).await;

    let rogue = vec![ModuleInfo::new("rogue", "6.6.6", "")];
    let result = TelemetryClient::connect(h.addr, rogue).await;
    assert!(result.is_err());

    let _ok = TelemetryClient::connect(h.addr, vec![agent()])
        .await
        .unwrap();
    wait_for("allowed module counted", || h.registry.get(&agent_key()) == 1).await;
    assert_eq!(h.registry.len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_releases_gauges() {
    let h = Harness::start().await;

    let _client = TelemetryClient::connect(h.addr, vec![agent()])
        .await
        .unwrap();
    wait_for("gauge to reach 1", || h.registry.get(&agent_key()) == 1).await;

    let registry = h.registry.clone();
    h.stop().await;
    assert_eq!(registry.get(&agent_key()), 0);
}

#[tokio::test]
async fn test_metrics_endpoint_over_http() {
    let h = Harness::start().await;
    let _client = TelemetryClient::connect(h.addr, vec![agent()])
        .await
        .unwrap();
    wait_for("gauge to reach 1", || h.registry.get(&agent_key()) == 1).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let metrics_addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(Notify::new());
    let state = Arc::new(ExporterState::new(h.registry.clone(), "telemetry"));
    let exporter_task = tokio::spawn(exporter::serve(listener, state, shutdown.clone()));

    let mut http = TcpStream::connect(metrics_addr).await.unwrap();
    http.write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, http.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("# TYPE telemetry_running_instances gauge"));
    assert!(response.contains(
        "telemetry_running_instances{module=\"agent\",version=\"1.0.0\",build_hash=\"\"} 1"
    ));

    shutdown.notify_one();
    tokio::time::timeout(WAIT, exporter_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    h.stop().await;
}
