// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry collector listener.

use crate::config::{ConfigError, ServerConfig};
use crate::metrics::GaugeSink;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod auth;
pub mod connection;
pub mod framing;
pub mod protocol;
pub mod session;

pub use connection::{ConnectionError, FramedConnection};
pub use framing::{FrameReassembler, FramingError, RawFrame};
pub use protocol::{ModuleInfo, Packet, PacketType, ProtocolError};
pub use session::{Session, SessionError, SessionPolicy, SessionState};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Telemetry collector - one session task per accepted connection.
#[derive(Clone)]
pub struct TelemetryServer {
    config: Arc<ServerConfig>,
    sink: Arc<dyn GaugeSink>,
    policy: Arc<SessionPolicy>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    active_sessions: Arc<AtomicUsize>,
}

impl TelemetryServer {
    /// Create a new collector reporting into `sink`.
    pub fn new(config: ServerConfig, sink: Arc<dyn GaugeSink>) -> Result<Self, ServerError> {
        config.validate()?;

        Ok(Self {
            policy: Arc::new(SessionPolicy::from_config(&config)),
            config: Arc::new(config),
            sink,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.telemetry_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(addr, e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        match listener.local_addr() {
            Ok(addr) => info!("Listening for telemetry on {}", addr),
            Err(e) => warn!("Listening for telemetry (local address unknown: {})", e),
        }

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if self.config.verbose {
                                info!("Accepted telemetry connection from {}", peer_addr);
                            } else {
                                debug!("Accepted telemetry connection from {}", peer_addr);
                            }

                            let config = self.config.clone();
                            let sink = self.sink.clone();
                            let policy = self.policy.clone();
                            let active = ActiveGuard::enter(self.active_sessions.clone());

                            sessions.spawn(async move {
                                let _active = active;
                                if let Err(e) =
                                    Self::handle_connection(stream, peer_addr, sink, policy, config)
                                        .await
                                {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept telemetry connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Session task panicked: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Aborting drops each session, which releases its gauges.
        let remaining = sessions.len();
        sessions.shutdown().await;
        if remaining > 0 {
            info!("Closed {} live session(s)", remaining);
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Handle a client connection.
    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        sink: Arc<dyn GaugeSink>,
        policy: Arc<SessionPolicy>,
        config: Arc<ServerConfig>,
    ) -> Result<(), ServerError> {
        let keepalive = config
            .tcp_keepalive
            .then(|| config.tcp_keepalive_interval());
        if let Err(e) = connection::configure_socket(&stream, keepalive, config.tcp_nodelay) {
            warn!("Failed to configure socket for {}: {}", peer_addr, e);
        }

        let mut conn = FramedConnection::new(stream, peer_addr, config.max_frame_size);
        let mut session = Session::new(peer_addr, sink, policy)?.with_verbose(config.verbose);

        let result = session.run(&mut conn, config.idle_timeout()).await;

        if config.verbose {
            info!("Connection closed: {}", peer_addr);
        } else {
            debug!("Connection closed: {}", peer_addr);
        }

        Ok(result?)
    }

    /// Signal the server to shutdown.
    pub fn shutdown(&self) {
        // notify_one keeps a permit if the accept loop is not parked yet.
        self.shutdown.notify_one();
    }

    /// Check if server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of connections currently being served.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Counts a live session task for as long as it exists.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Server error types.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bind error on {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}
