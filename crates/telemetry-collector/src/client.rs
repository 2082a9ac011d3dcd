// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry client.
//!
//! Connects to a collector, claims a set of modules, answers the key
//! challenge and then keeps the connection alive with heartbeats.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), telemetry_collector::client::ClientError> {
//! use std::time::Duration;
//! use telemetry_collector::client::TelemetryClient;
//! use telemetry_collector::ModuleInfo;
//!
//! let modules = vec![ModuleInfo::new("agent", "1.0.0", "")];
//! let mut client = TelemetryClient::connect("127.0.0.1:65500", modules).await?;
//! client.run_heartbeats(Duration::from_secs(30), None).await?;
//! # Ok(())
//! # }
//! ```

use crate::server::auth::compute_tag;
use crate::server::connection::{ConnectionError, FramedConnection};
use crate::server::protocol::{ModuleInfo, Packet, PacketType, MAX_FRAME_PAYLOAD};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// An authenticated-or-rejected telemetry connection.
///
/// The collector answers a bad tag exactly like a good one, so a client never
/// learns whether it was counted.
pub struct TelemetryClient<S = TcpStream> {
    conn: FramedConnection<S>,
    modules: Vec<ModuleInfo>,
    heartbeats_sent: u64,
}

impl TelemetryClient<TcpStream> {
    /// Connect over TCP and complete the handshake.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        modules: Vec<ModuleInfo>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Self::establish(stream, peer_addr, modules).await
    }
}

impl<S> TelemetryClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake and start exchange over an existing stream.
    pub async fn establish(
        stream: S,
        peer_addr: SocketAddr,
        modules: Vec<ModuleInfo>,
    ) -> Result<Self, ClientError> {
        let mut conn = FramedConnection::new(stream, peer_addr, MAX_FRAME_PAYLOAD);

        conn.send_packet(&Packet::HandshakeRequest {
            modules: modules.clone(),
        })
        .await?;

        let key = match conn.read_packet().await? {
            Some(Packet::HandshakeResponse { key }) => key,
            Some(other) => {
                return Err(ClientError::UnexpectedPacket {
                    expected: PacketType::HandshakeResponse,
                    got: other.packet_type(),
                })
            }
            None => return Err(ClientError::Disconnected),
        };
        debug!("Received session key from {}", peer_addr);

        conn.send_packet(&Packet::StartRequest {
            tag: compute_tag(&key, &modules),
        })
        .await?;

        match conn.read_packet().await? {
            Some(Packet::StartResponse) => {}
            Some(other) => {
                return Err(ClientError::UnexpectedPacket {
                    expected: PacketType::StartResponse,
                    got: other.packet_type(),
                })
            }
            None => return Err(ClientError::Disconnected),
        }

        info!("Registered {} module(s) with {}", modules.len(), peer_addr);

        Ok(Self {
            conn,
            modules,
            heartbeats_sent: 0,
        })
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent
    }

    /// Send one heartbeat.
    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        self.conn.send_packet(&Packet::HeartbeatRequest).await?;
        self.heartbeats_sent += 1;
        Ok(())
    }

    /// Send heartbeats every `period`, stopping after `count` if given.
    ///
    /// Returns [`ClientError::Disconnected`] if the collector closes the
    /// connection first.
    pub async fn run_heartbeats(
        &mut self,
        period: Duration,
        count: Option<u64>,
    ) -> Result<(), ClientError> {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut sent = 0u64;
        loop {
            if count.is_some_and(|limit| sent >= limit) {
                return Ok(());
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat().await?;
                    sent += 1;
                    debug!("Heartbeat #{} sent to {}", self.heartbeats_sent, self.peer_addr());
                }
                packet = self.conn.read_packet() => {
                    match packet? {
                        Some(other) => debug!("Ignoring {:?} from collector", other.packet_type()),
                        None => return Err(ClientError::Disconnected),
                    }
                }
            }
        }
    }

    /// Close the write half so the collector sees EOF.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.conn.shutdown().await?;
        Ok(())
    }
}

/// Parse `name:version[:build_hash]`.
pub fn parse_module_spec(spec: &str) -> Result<ModuleInfo, String> {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    let build_hash = parts.next().unwrap_or_default();

    if name.is_empty() || version.is_empty() {
        return Err(format!(
            "invalid module {:?}: expected name:version[:build_hash]",
            spec
        ));
    }
    Ok(ModuleInfo::new(name, version, build_hash))
}

/// Client error types.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Expected {expected:?}, received {got:?}")]
    UnexpectedPacket { expected: PacketType, got: PacketType },

    #[error("Collector closed the connection")]
    Disconnected,
}
