// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection session state machine.
//!
//! ```text
//!                  HandshakeRequest            StartRequest (valid)
//! AwaitingHandshake ---------------> AwaitingStart ---------------> Authenticated
//!        ^                             |     ^                          |
//!        |    StartRequest (invalid)   |     | HandshakeRequest         | HeartbeatRequest
//!        +-----------------------------+     +-- (fresh key)            +--(self)
//!
//! Any other packet, framing error, EOF or idle timeout -> Closed
//! ```
//!
//! A session owns its key, its claimed modules and its gauge lease. Nothing
//! here is shared with other sessions except the gauge sink.

use super::auth::{AuthError, Challenge, SessionKey};
use super::connection::{ConnectionError, FramedConnection};
use super::protocol::{ModuleInfo, Packet, PacketType};
use crate::config::ServerConfig;
use crate::metrics::{GaugeLease, GaugeSink, ModuleKey};
use ring::rand::SystemRandom;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    AwaitingStart,
    Authenticated,
    Closed,
}

/// Limits and allowlist applied to every handshake.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub max_modules: usize,
    pub max_field_len: usize,
    /// Allowed versions per module name; empty accepts everything.
    pub known_modules: BTreeMap<String, Vec<String>>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl SessionPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_modules: config.max_modules_per_handshake,
            max_field_len: config.max_field_len,
            known_modules: config.known_modules.clone(),
        }
    }

    /// Check a claimed module list.
    pub fn check(&self, modules: &[ModuleInfo]) -> Result<(), PolicyViolation> {
        if modules.is_empty() {
            return Err(PolicyViolation::NoModules);
        }
        if modules.len() > self.max_modules {
            return Err(PolicyViolation::TooManyModules {
                count: modules.len(),
                max: self.max_modules,
            });
        }
        for (index, module) in modules.iter().enumerate() {
            if module.name.is_empty() || module.version.is_empty() {
                return Err(PolicyViolation::EmptyField { index });
            }
            let longest = module
                .name
                .len()
                .max(module.version.len())
                .max(module.build_hash.len());
            if longest > self.max_field_len {
                return Err(PolicyViolation::FieldTooLong {
                    index,
                    len: longest,
                    max: self.max_field_len,
                });
            }
            if !self.is_known(module) {
                return Err(PolicyViolation::UnknownModule {
                    name: module.name.clone(),
                    version: module.version.clone(),
                });
            }
        }
        Ok(())
    }

    fn is_known(&self, module: &ModuleInfo) -> bool {
        if self.known_modules.is_empty() {
            return true;
        }
        self.known_modules
            .get(&module.name)
            .is_some_and(|versions| versions.iter().any(|v| *v == module.version))
    }
}

/// Server side of one telemetry connection.
pub struct Session {
    peer_addr: SocketAddr,
    state: SessionState,
    rng: SystemRandom,
    key: SessionKey,
    key_issued: bool,
    claimed_modules: Vec<ModuleInfo>,
    challenge: Option<Challenge>,
    authenticated: bool,
    lease: Option<GaugeLease>,
    sink: Arc<dyn GaugeSink>,
    policy: Arc<SessionPolicy>,
    handshakes: u32,
    heartbeats: u64,
    last_heartbeat: Option<Instant>,
    verbose: bool,
}

impl Session {
    /// Create a session and generate its first key.
    pub fn new(
        peer_addr: SocketAddr,
        sink: Arc<dyn GaugeSink>,
        policy: Arc<SessionPolicy>,
    ) -> Result<Self, SessionError> {
        let rng = SystemRandom::new();
        let key = SessionKey::generate(&rng)?;
        Ok(Self {
            peer_addr,
            state: SessionState::AwaitingHandshake,
            rng,
            key,
            key_issued: false,
            claimed_modules: Vec::new(),
            challenge: None,
            authenticated: false,
            lease: None,
            sink,
            policy,
            handshakes: 0,
            heartbeats: 0,
            last_heartbeat: None,
            verbose: false,
        })
    }

    /// Log close at info level instead of debug.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn claimed_modules(&self) -> &[ModuleInfo] {
        &self.claimed_modules
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Advance the state machine with one packet.
    ///
    /// Returns the reply to send, if any. An error means the connection must
    /// be dropped; the session is already closed when it is returned.
    pub fn handle(&mut self, packet: Packet) -> Result<Option<Packet>, SessionError> {
        match (self.state, packet) {
            (SessionState::Closed, _) => Err(SessionError::Closed),

            (
                SessionState::AwaitingHandshake | SessionState::AwaitingStart,
                Packet::HandshakeRequest { modules },
            ) => self.on_handshake(modules),

            (SessionState::AwaitingStart, Packet::StartRequest { tag }) => Ok(self.on_start(&tag)),

            (SessionState::Authenticated, Packet::HeartbeatRequest) => {
                if !self.authenticated {
                    return Err(self.violation(SessionError::NotAuthenticated));
                }
                self.heartbeats += 1;
                self.last_heartbeat = Some(Instant::now());
                trace!("Heartbeat #{} from {}", self.heartbeats, self.peer_addr);
                Ok(None)
            }

            (state, packet) => Err(self.violation(SessionError::UnexpectedPacket {
                state,
                packet: packet.packet_type(),
            })),
        }
    }

    fn on_handshake(&mut self, modules: Vec<ModuleInfo>) -> Result<Option<Packet>, SessionError> {
        if let Err(e) = self.policy.check(&modules) {
            return Err(self.violation(SessionError::Policy(e)));
        }

        // A key goes out at most once; every later handshake gets a new one.
        if self.key_issued {
            self.key = match SessionKey::generate(&self.rng) {
                Ok(key) => key,
                Err(e) => return Err(self.violation(e.into())),
            };
        }
        self.key_issued = true;
        self.handshakes += 1;

        debug!(
            "Handshake #{} from {}: {} module(s)",
            self.handshakes,
            self.peer_addr,
            modules.len()
        );

        self.challenge = Some(Challenge::new(&self.key, &modules));
        self.claimed_modules = modules;
        self.state = SessionState::AwaitingStart;

        Ok(Some(Packet::HandshakeResponse {
            key: *self.key.as_bytes(),
        }))
    }

    fn on_start(&mut self, tag: &[u8]) -> Option<Packet> {
        // One verification per issued key.
        let valid = self
            .challenge
            .take()
            .is_some_and(|challenge| challenge.verify(tag));

        if valid {
            let keys = self.claimed_modules.iter().map(ModuleKey::from).collect();
            self.lease = Some(GaugeLease::acquire(self.sink.clone(), keys));
            self.authenticated = true;
            self.state = SessionState::Authenticated;
            for module in &self.claimed_modules {
                info!("{} authenticated as {}", self.peer_addr, module);
            }
        } else {
            warn!("Invalid start tag from {}", self.peer_addr);
            self.claimed_modules.clear();
            self.state = SessionState::AwaitingHandshake;
        }

        // Same reply either way.
        Some(Packet::StartResponse)
    }

    fn violation(&mut self, err: SessionError) -> SessionError {
        warn!("Protocol violation from {}: {}", self.peer_addr, err);
        self.close();
        err
    }

    /// Close the session and release its gauges. Idempotent.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.challenge = None;
        if let Some(lease) = self.lease.take() {
            if self.verbose {
                info!(
                    "Released {} gauge(s) for {}",
                    lease.keys().len(),
                    self.peer_addr
                );
            } else {
                debug!(
                    "Released {} gauge(s) for {}",
                    lease.keys().len(),
                    self.peer_addr
                );
            }
        }
    }

    /// Drive the session over a framed connection until it ends.
    ///
    /// Malformed frame bodies are skipped. EOF ends the session cleanly;
    /// everything else is returned as an error. The session is closed on
    /// return in every case.
    pub async fn run<S>(
        &mut self,
        conn: &mut FramedConnection<S>,
        idle_timeout: Option<Duration>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.pump(conn, idle_timeout).await;
        self.close();
        result
    }

    async fn pump<S>(
        &mut self,
        conn: &mut FramedConnection<S>,
        idle_timeout: Option<Duration>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let next = match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, conn.read_frame())
                    .await
                    .unwrap_or(Err(ConnectionError::IdleTimeout(limit))),
                None => conn.read_frame().await,
            };

            let Some(frame) = next? else {
                return Ok(());
            };

            let packet = match frame.decode() {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Dropping malformed frame from {}: {}", self.peer_addr, e);
                    continue;
                }
            };

            if let Some(reply) = self.handle(packet)? {
                conn.send_packet(&reply).await?;
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("authenticated", &self.authenticated)
            .field("claimed_modules", &self.claimed_modules)
            .field("heartbeats", &self.heartbeats)
            .finish_non_exhaustive()
    }
}

/// Handshake policy violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("handshake claims no modules")]
    NoModules,

    #[error("handshake claims {count} modules (max {max})")]
    TooManyModules { count: usize, max: usize },

    #[error("module #{index} has an empty name or version")]
    EmptyField { index: usize },

    #[error("module #{index} has a {len}-byte field (max {max})")]
    FieldTooLong { index: usize, len: usize, max: usize },

    #[error("unknown module {name} {version}")]
    UnknownModule { name: String, version: String },
}

/// Session error types.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unexpected {packet:?} in state {state:?}")]
    UnexpectedPacket {
        state: SessionState,
        packet: PacketType,
    },

    #[error("Heartbeat from unauthenticated session")]
    NotAuthenticated,

    #[error("Handshake rejected: {0}")]
    Policy(PolicyViolation),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Session closed")]
    Closed,

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::GaugeRegistry;
    use crate::server::auth::compute_tag;
    use crate::server::protocol::KEY_SIZE;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    /// Records every sink call in order.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(bool, ModuleKey)>>,
    }

    impl GaugeSink for RecordingSink {
        fn increment(&self, key: &ModuleKey) {
            self.events.lock().unwrap().push((true, key.clone()));
        }

        fn decrement(&self, key: &ModuleKey) {
            self.events.lock().unwrap().push((false, key.clone()));
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:50000".parse().unwrap()
    }

    fn agent() -> ModuleInfo {
        ModuleInfo::new("agent", "1.0.0", "")
    }

    fn session_with(sink: Arc<dyn GaugeSink>) -> Session {
        Session::new(peer(), sink, Arc::new(SessionPolicy::default())).unwrap()
    }

    fn handshake(session: &mut Session, modules: Vec<ModuleInfo>) -> [u8; KEY_SIZE] {
        match session.handle(Packet::HandshakeRequest { modules }).unwrap() {
            Some(Packet::HandshakeResponse { key }) => key,
            other => panic!("Expected handshake response, got {:?}", other),
        }
    }

    fn authenticate(session: &mut Session, modules: Vec<ModuleInfo>) {
        let key = handshake(session, modules.clone());
        let reply = session
            .handle(Packet::StartRequest {
                tag: compute_tag(&key, &modules),
            })
            .unwrap();
        assert_eq!(reply, Some(Packet::StartResponse));
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_happy_path() {
        let registry = Arc::new(GaugeRegistry::new());
        let mut session = session_with(registry.clone());
        assert_eq!(session.state(), SessionState::AwaitingHandshake);

        let key = handshake(&mut session, vec![agent()]);
        assert_eq!(session.state(), SessionState::AwaitingStart);
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 0);

        let reply = session
            .handle(Packet::StartRequest {
                tag: compute_tag(&key, &[agent()]),
            })
            .unwrap();
        assert_eq!(reply, Some(Packet::StartResponse));
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 1);

        assert_eq!(session.handle(Packet::HeartbeatRequest).unwrap(), None);
        assert_eq!(session.heartbeats(), 1);
        assert!(session.last_heartbeat().is_some());
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 1);

        session.close();
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 0);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_invalid_tag_gets_same_reply_and_no_gauge() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = session_with(sink.clone());

        let key = handshake(&mut session, vec![agent()]);
        let mut tag = compute_tag(&key, &[agent()]);
        tag[17] ^= 0x04;

        let reply = session.handle(Packet::StartRequest { tag }).unwrap();
        assert_eq!(reply, Some(Packet::StartResponse));
        assert!(!session.is_authenticated());
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
        assert!(session.claimed_modules().is_empty());

        session.close();
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_after_failure_needs_fresh_handshake() {
        let registry = Arc::new(GaugeRegistry::new());
        let mut session = session_with(registry.clone());

        let first = handshake(&mut session, vec![agent()]);
        session
            .handle(Packet::StartRequest { tag: [0u8; 32] })
            .unwrap();

        // Replaying a start request without a new handshake is a violation.
        let err = session
            .handle(Packet::StartRequest {
                tag: compute_tag(&first, &[agent()]),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::UnexpectedPacket { .. }));
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 0);
    }

    #[test]
    fn test_second_handshake_rotates_key() {
        let registry = Arc::new(GaugeRegistry::new());
        let mut session = session_with(registry.clone());

        let first = handshake(&mut session, vec![agent()]);
        let second = handshake(&mut session, vec![agent()]);
        assert_ne!(first, second);

        session
            .handle(Packet::StartRequest {
                tag: compute_tag(&first, &[agent()]),
            })
            .unwrap();
        assert!(!session.is_authenticated());
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 0);

        // A third handshake issues yet another key, which does authenticate.
        let third = handshake(&mut session, vec![agent()]);
        assert_ne!(third, first);
        assert_ne!(third, second);
        session
            .handle(Packet::StartRequest {
                tag: compute_tag(&third, &[agent()]),
            })
            .unwrap();
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_claimed_modules_bound_to_tag() {
        let mut session = session_with(Arc::new(GaugeRegistry::new()));
        let key = handshake(&mut session, vec![agent()]);
        let forged = compute_tag(&key, &[ModuleInfo::new("agent", "9.9.9", "")]);
        session.handle(Packet::StartRequest { tag: forged }).unwrap();
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_multi_module_lease_exactly_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = session_with(sink.clone());
        let modules = vec![agent(), ModuleInfo::new("plugin", "0.2.0", "beef")];
        authenticate(&mut session, modules.clone());

        session.close();
        session.close();
        drop(session);

        let events = sink.events.lock().unwrap();
        let keys: Vec<ModuleKey> = modules.iter().map(ModuleKey::from).collect();
        assert_eq!(
            *events,
            vec![
                (true, keys[0].clone()),
                (true, keys[1].clone()),
                (false, keys[0].clone()),
                (false, keys[1].clone()),
            ]
        );
    }

    #[test]
    fn test_drop_releases_lease() {
        let registry = Arc::new(GaugeRegistry::new());
        let mut session = session_with(registry.clone());
        authenticate(&mut session, vec![agent()]);
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 1);
        drop(session);
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 0);
    }

    #[test]
    fn test_packets_out_of_order_close() {
        let cases = [
            Packet::HeartbeatRequest,
            Packet::StartRequest { tag: [0; 32] },
            Packet::StartResponse,
            Packet::HandshakeResponse { key: [0; 32] },
            Packet::HeartbeatResponse,
        ];
        for packet in cases {
            let mut session = session_with(Arc::new(GaugeRegistry::new()));
            let err = session.handle(packet).unwrap_err();
            assert!(matches!(
                err,
                SessionError::UnexpectedPacket {
                    state: SessionState::AwaitingHandshake,
                    ..
                }
            ));
            assert_eq!(session.state(), SessionState::Closed);
            assert!(matches!(
                session.handle(Packet::HeartbeatRequest),
                Err(SessionError::Closed)
            ));
        }
    }

    #[test]
    fn test_heartbeat_before_start_closes() {
        let mut session = session_with(Arc::new(GaugeRegistry::new()));
        handshake(&mut session, vec![agent()]);
        assert!(session.handle(Packet::HeartbeatRequest).is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_no_reauthentication() {
        let registry = Arc::new(GaugeRegistry::new());
        let mut session = session_with(registry.clone());
        authenticate(&mut session, vec![agent()]);

        let err = session
            .handle(Packet::HandshakeRequest {
                modules: vec![ModuleInfo::new("other", "1", "")],
            })
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::UnexpectedPacket {
                state: SessionState::Authenticated,
                packet: PacketType::HandshakeRequest,
            }
        ));
        // The violation closed the session and released the gauge.
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 0);
        assert_eq!(registry.get(&ModuleKey::new("other", "1", "")), 0);
    }

    #[test]
    fn test_policy_limits() {
        let policy = SessionPolicy {
            max_modules: 2,
            max_field_len: 8,
            known_modules: BTreeMap::new(),
        };
        assert_eq!(policy.check(&[]), Err(PolicyViolation::NoModules));
        assert!(matches!(
            policy.check(&[agent(), agent(), agent()]),
            Err(PolicyViolation::TooManyModules { count: 3, max: 2 })
        ));
        assert_eq!(
            policy.check(&[ModuleInfo::new("", "1", "")]),
            Err(PolicyViolation::EmptyField { index: 0 })
        );
        assert_eq!(
            policy.check(&[agent(), ModuleInfo::new("x", "1", "0123456789")]),
            Err(PolicyViolation::FieldTooLong {
                index: 1,
                len: 10,
                max: 8
            })
        );
        assert!(policy.check(&[agent()]).is_ok());
    }

    #[test]
    fn test_policy_allowlist() {
        let mut known = BTreeMap::new();
        known.insert("agent".to_string(), vec!["1.0.0".to_string()]);
        let policy = Arc::new(SessionPolicy {
            known_modules: known,
            ..SessionPolicy::default()
        });

        assert!(policy.check(&[agent()]).is_ok());
        assert!(matches!(
            policy.check(&[ModuleInfo::new("agent", "2.0.0", "")]),
            Err(PolicyViolation::UnknownModule { .. })
        ));

        let mut session =
            Session::new(peer(), Arc::new(GaugeRegistry::new()), policy).unwrap();
        let err = session
            .handle(Packet::HandshakeRequest {
                modules: vec![ModuleInfo::new("rogue", "1.0.0", "")],
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::Policy(_)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_run_over_duplex() {
        let registry = Arc::new(GaugeRegistry::new());
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut client = FramedConnection::new(client_io, peer(), 65535);
        let mut server = FramedConnection::new(server_io, peer(), 65535);

        let mut session = session_with(registry.clone());
        let task = tokio::spawn(async move {
            let result = session.run(&mut server, None).await;
            (session, result)
        });

        client
            .send_packet(&Packet::HandshakeRequest {
                modules: vec![agent()],
            })
            .await
            .unwrap();
        let key = match client.read_packet().await.unwrap() {
            Some(Packet::HandshakeResponse { key }) => key,
            other => panic!("Expected key, got {:?}", other),
        };

        // A malformed frame in between is skipped, not fatal.
        let junk = [0x00, 0x02, 0x77, 0x00];
        client.stream_mut().write_all(&junk).await.unwrap();

        client
            .send_packet(&Packet::StartRequest {
                tag: compute_tag(&key, &[agent()]),
            })
            .await
            .unwrap();
        assert_eq!(
            client.read_packet().await.unwrap(),
            Some(Packet::StartResponse)
        );
        client.send_packet(&Packet::HeartbeatRequest).await.unwrap();

        drop(client);
        let (session, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.heartbeats(), 1);
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 0);
    }

    #[tokio::test]
    async fn test_run_idle_timeout() {
        let registry = Arc::new(GaugeRegistry::new());
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut client = FramedConnection::new(client_io, peer(), 65535);
        let mut server = FramedConnection::new(server_io, peer(), 65535);
        let mut session = session_with(registry.clone());

        client
            .send_packet(&Packet::HandshakeRequest {
                modules: vec![agent()],
            })
            .await
            .unwrap();

        let result = session
            .run(&mut server, Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Connection(ConnectionError::IdleTimeout(_)))
        ));
        assert_eq!(session.state(), SessionState::Closed);
        drop(client);
    }

    #[tokio::test]
    async fn test_idle_timeout_releases_gauges() {
        let registry = Arc::new(GaugeRegistry::new());
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut client = FramedConnection::new(client_io, peer(), 65535);
        let mut server = FramedConnection::new(server_io, peer(), 65535);

        let mut session = session_with(registry.clone());
        let task = tokio::spawn(async move {
            let result = session
                .run(&mut server, Some(Duration::from_millis(50)))
                .await;
            (session, result)
        });

        client
            .send_packet(&Packet::HandshakeRequest {
                modules: vec![agent()],
            })
            .await
            .unwrap();
        let key = match client.read_packet().await.unwrap() {
            Some(Packet::HandshakeResponse { key }) => key,
            other => panic!("Expected key, got {:?}", other),
        };
        client
            .send_packet(&Packet::StartRequest {
                tag: compute_tag(&key, &[agent()]),
            })
            .await
            .unwrap();
        assert_eq!(
            client.read_packet().await.unwrap(),
            Some(Packet::StartResponse)
        );
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 1);

        // Stay silent past the timeout with the connection still open.
        let (session, result) = task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Connection(ConnectionError::IdleTimeout(_)))
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.get(&ModuleKey::from(&agent())), 0);
        assert!(registry.is_empty());
        drop(client);
    }
}
