// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Prometheus scrape endpoint.
//!
//! - `GET /metrics` - running-instance gauges in text exposition format
//! - `GET /health` - liveness probe

use crate::metrics::GaugeRegistry;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

/// Content type of the Prometheus text format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared exporter state
pub struct ExporterState {
    registry: Arc<GaugeRegistry>,
    namespace: String,
}

impl ExporterState {
    pub fn new(registry: Arc<GaugeRegistry>, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
        }
    }
}

/// Build the exporter routes.
pub fn router(state: Arc<ExporterState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

/// GET /metrics
pub async fn metrics(State(state): State<Arc<ExporterState>>) -> Response {
    let body = state.registry.render_prometheus(&state.namespace);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}

/// Serve the exporter on `listener` until `shutdown` is notified.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ExporterState>,
    shutdown: Arc<Notify>,
) -> Result<(), ExporterError> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening for metrics requests on http://{}/metrics", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
        .map_err(ExporterError::Serve)
}

/// Bind the metrics listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ExporterError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ExporterError::Bind(addr, e))
}

/// Bind `addr` and serve the exporter until `shutdown` is notified.
pub async fn run(
    addr: SocketAddr,
    state: Arc<ExporterState>,
    shutdown: Arc<Notify>,
) -> Result<(), ExporterError> {
    let listener = bind(addr).await?;
    serve(listener, state, shutdown).await
}

/// Exporter error types.
#[derive(Debug, thiserror::Error)]
pub enum ExporterError {
    #[error("Bind error on {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    #[error("HTTP server error: {0}")]
    Serve(std::io::Error),
}
