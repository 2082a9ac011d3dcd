// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry Collector
//!
//! Counts live instances of named modules. Each instance keeps one TCP
//! connection open to the collector, proves it received the collector's
//! per-connection key, then sends periodic heartbeats. Authenticated
//! connections are reported as Prometheus gauges keyed by
//! (module, version, build hash).
//!
//! # Layers
//!
//! - [`server::protocol`] - packet types and their binary encoding
//! - [`server::framing`] - reassembly of length-prefixed frames from a stream
//! - [`server::auth`] - session keys and HMAC-SHA256 tags
//! - [`server::session`] - per-connection state machine
//! - [`server`] - accept loop, one task per connection
//! - [`metrics`] - gauge sink and registry
//! - [`exporter`] - `/metrics` HTTP endpoint
//! - [`client`] - reference client

pub mod client;
pub mod config;
pub mod exporter;
pub mod metrics;
pub mod server;

pub use client::{ClientError, TelemetryClient};
pub use config::{ConfigError, ServerConfig};
pub use metrics::{GaugeLease, GaugeRegistry, GaugeSink, ModuleKey};
pub use server::{ModuleInfo, Packet, PacketType, ServerError, TelemetryServer};
