// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry Probe
//!
//! Registers one or more modules with a collector and keeps them alive.
//!
//! ```bash
//! telemetry-probe --module agent:1.0.0
//! telemetry-probe --addr 10.0.0.5:65500 --interval 5 \
//!     --module host:2.1.0:abc123 --module plugin:0.3.0
//! ```

use clap::Parser;
use std::time::Duration;
use telemetry_collector::client::{parse_module_spec, TelemetryClient};
use telemetry_collector::ModuleInfo;
use tracing::{info, Level};

/// Telemetry Probe - register modules with a telemetry collector
#[derive(Parser, Debug)]
#[command(name = "telemetry-probe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Collector address
    #[arg(short, long, default_value = "127.0.0.1:65500")]
    addr: String,

    /// Module to claim, as name:version[:build_hash] (repeatable)
    #[arg(short, long = "module", required = true, value_parser = parse_module_spec)]
    modules: Vec<ModuleInfo>,

    /// Seconds between heartbeats
    #[arg(short, long, default_value = "30")]
    interval: u64,

    /// Stop after this many heartbeats (default: run until interrupted)
    #[arg(short, long)]
    count: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = args.log_level.parse().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    for module in &args.modules {
        info!("Claiming {}", module);
    }

    let mut client = TelemetryClient::connect(args.addr.as_str(), args.modules).await?;
    let period = Duration::from_secs(args.interval.max(1));

    tokio::select! {
        result = client.run_heartbeats(period, args.count) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    info!("Sent {} heartbeat(s)", client.heartbeats_sent());
    client.close().await?;
    Ok(())
}
