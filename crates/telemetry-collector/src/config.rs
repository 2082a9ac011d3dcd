// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collector configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept telemetry connections on (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Telemetry TCP port (default: 65500)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Serve the Prometheus metrics endpoint
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Address for the metrics HTTP endpoint (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub metrics_bind_address: IpAddr,

    /// Metrics HTTP port (default: 65501)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Prefix of the exported gauge name
    #[serde(default = "default_metrics_namespace")]
    pub metrics_namespace: String,

    /// Enable TCP keepalive on client connections
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,

    /// TCP keepalive idle time in seconds
    #[serde(default = "default_keepalive_interval")]
    pub tcp_keepalive_interval_secs: u64,

    /// Disable Nagle on client connections
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// Close a connection that sends no frame for this long (0 = never)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Largest accepted frame payload (type byte + body)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Largest number of modules a single handshake may claim
    #[serde(default = "default_max_modules")]
    pub max_modules_per_handshake: usize,

    /// Largest accepted name/version/build hash, in bytes
    #[serde(default = "default_max_field_len")]
    pub max_field_len: usize,

    /// Allowed module versions; empty map accepts every module
    #[serde(default)]
    pub known_modules: BTreeMap<String, Vec<String>>,

    /// Log connection lifecycle at info level
    #[serde(default)]
    pub verbose: bool,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    65500
}

fn default_metrics_port() -> u16 {
    65501
}

fn default_metrics_namespace() -> String {
    "telemetry".into()
}

fn default_true() -> bool {
    true
}

fn default_keepalive_interval() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_max_frame_size() -> usize {
    u16::MAX as usize
}

fn default_max_modules() -> usize {
    32
}

fn default_max_field_len() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            metrics_enabled: true,
            metrics_bind_address: default_bind_address(),
            metrics_port: default_metrics_port(),
            metrics_namespace: default_metrics_namespace(),
            tcp_keepalive: true,
            tcp_keepalive_interval_secs: default_keepalive_interval(),
            tcp_nodelay: true,
            idle_timeout_secs: default_idle_timeout(),
            max_frame_size: default_max_frame_size(),
            max_modules_per_handshake: default_max_modules(),
            max_field_len: default_max_field_len(),
            known_modules: BTreeMap::new(),
            verbose: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Telemetry listener address.
    pub fn telemetry_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Metrics endpoint address.
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.metrics_bind_address, self.metrics_port)
    }

    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn tcp_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.tcp_keepalive_interval_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u16::MAX as usize {
            return Err(ConfigError::InvalidValue(format!(
                "max_frame_size must be within 1..={}",
                u16::MAX
            )));
        }
        if self.max_modules_per_handshake == 0 {
            return Err(ConfigError::InvalidValue(
                "max_modules_per_handshake cannot be 0".into(),
            ));
        }
        if self.max_field_len == 0 {
            return Err(ConfigError::InvalidValue("max_field_len cannot be 0".into()));
        }
        if self.tcp_keepalive && self.tcp_keepalive_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "tcp_keepalive_interval_secs cannot be 0 when keepalive is enabled".into(),
            ));
        }
        if self.metrics_enabled {
            if self.metrics_port == 0 {
                return Err(ConfigError::InvalidValue("metrics_port cannot be 0".into()));
            }
            if self.metrics_addr() == self.telemetry_addr() {
                return Err(ConfigError::InvalidValue(
                    "metrics endpoint and telemetry listener share an address".into(),
                ));
            }
            if self.metrics_namespace.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "metrics_namespace cannot be empty".into(),
                ));
            }
        }
        if let Some((name, _)) = self.known_modules.iter().find(|(_, v)| v.is_empty()) {
            return Err(ConfigError::InvalidValue(format!(
                "known module {:?} lists no versions",
                name
            )));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
