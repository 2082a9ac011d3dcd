// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry Collector
//!
//! Accepts long-lived module connections and exposes the number of live,
//! authenticated instances per module as Prometheus gauges.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: telemetry on 127.0.0.1:65500, metrics on 127.0.0.1:65501
//! telemetry-collector
//!
//! # Public listener, custom metrics address
//! telemetry-collector --telemetry-addr 0.0.0.0:65500 --metrics-addr 0.0.0.0:9100
//!
//! # From a config file
//! telemetry-collector --config collector.json
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry_collector::exporter::{self, ExporterState};
use telemetry_collector::{GaugeRegistry, ServerConfig, TelemetryServer};
use tokio::sync::Notify;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Telemetry Collector - live module instance gauges
#[derive(Parser, Debug)]
#[command(name = "telemetry-collector")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen for telemetry connections on
    #[arg(long, default_value = "127.0.0.1:65500")]
    telemetry_addr: SocketAddr,

    /// Address to serve /metrics on
    #[arg(long, default_value = "127.0.0.1:65501")]
    metrics_addr: SocketAddr,

    /// Configuration file (JSON format); overrides the flags above
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not serve the metrics endpoint
    #[arg(long, default_value = "false")]
    no_metrics: bool,

    /// Close connections silent for this many seconds (0 = never)
    #[arg(long, default_value = "90")]
    idle_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log every connection open/close
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Load or create config
    let mut config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::from_file(&config_path)?
    } else {
        ServerConfig {
            bind_address: args.telemetry_addr.ip(),
            port: args.telemetry_addr.port(),
            metrics_enabled: !args.no_metrics,
            metrics_bind_address: args.metrics_addr.ip(),
            metrics_port: args.metrics_addr.port(),
            idle_timeout_secs: args.idle_timeout,
            ..Default::default()
        }
    };
    config.verbose |= args.verbose;

    info!("+----------------------------------------------------+");
    info!(
        "|       Telemetry Collector v{}                  |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Telemetry: {:37} |", config.telemetry_addr());
    info!(
        "|  Metrics:   {:37} |",
        if config.metrics_enabled {
            config.metrics_addr().to_string()
        } else {
            "disabled".to_string()
        }
    );
    info!(
        "|  Idle:      {:37} |",
        match config.idle_timeout() {
            Some(d) => format!("{}s", d.as_secs()),
            None => "never".to_string(),
        }
    );
    info!(
        "|  Allowlist: {:37} |",
        if config.known_modules.is_empty() {
            "any module".to_string()
        } else {
            format!("{} module(s)", config.known_modules.len())
        }
    );
    info!("+----------------------------------------------------+");

    let registry = Arc::new(GaugeRegistry::new());
    let server = TelemetryServer::new(config.clone(), registry.clone())?;

    // Metrics endpoint
    let exporter_shutdown = Arc::new(Notify::new());
    let exporter_task = if config.metrics_enabled {
        // Bind before serving telemetry so a taken port aborts startup.
        let listener = exporter::bind(config.metrics_addr()).await?;
        let state = Arc::new(ExporterState::new(
            registry.clone(),
            config.metrics_namespace.clone(),
        ));
        let shutdown = exporter_shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = exporter::serve(listener, state, shutdown).await {
                error!("Metrics endpoint failed: {}", e);
            }
        }))
    } else {
        None
    };

    // Handle shutdown signals
    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping collector...");
        server_handle.shutdown();
    });

    // Run server
    server.run().await?;

    exporter_shutdown.notify_one();
    if let Some(task) = exporter_task {
        task.await.ok();
    }

    info!("Telemetry collector stopped");
    Ok(())
}
