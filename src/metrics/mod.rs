//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Request intake and state transitions
//! - Ledger calls per chain
//! - Settlement latency

use crate::error::{BridgeError, BridgeResult};
use crate::request::{Chain, Direction, RequestState};
use crate::store::RequestStats;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Request metrics
    pub static ref REQUESTS_INITIATED: CounterVec = register_counter_vec!(
        "ckbridge_requests_initiated_total",
        "Total bridge requests accepted",
        &["direction"]
    ).unwrap();

    pub static ref STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "ckbridge_state_transitions_total",
        "Persisted request state transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref REQUESTS_BY_STATE: GaugeVec = register_gauge_vec!(
        "ckbridge_requests",
        "Requests currently in each state",
        &["state"]
    ).unwrap();

    pub static ref SETTLEMENT_LATENCY: HistogramVec = register_histogram_vec!(
        "ckbridge_settlement_latency_seconds",
        "Time from request creation to settlement",
        &["direction"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // Ledger metrics
    pub static ref LEDGER_CALLS: CounterVec = register_counter_vec!(
        "ckbridge_ledger_calls_total",
        "Ledger adapter calls by outcome",
        &["chain", "call", "outcome"]
    ).unwrap();

    // Engine metrics
    pub static ref RECONCILE_PASSES: CounterVec = register_counter_vec!(
        "ckbridge_reconcile_passes_total",
        "Reconciliation passes by result",
        &["result"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| BridgeError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_request_initiated(direction: Direction) {
    REQUESTS_INITIATED
        .with_label_values(&[direction.as_str()])
        .inc();
}

pub fn record_transition(from: RequestState, to: RequestState) {
    if from != to {
        STATE_TRANSITIONS
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }
}

pub fn record_settlement_latency(direction: Direction, latency_secs: f64) {
    SETTLEMENT_LATENCY
        .with_label_values(&[direction.as_str()])
        .observe(latency_secs);
}

pub fn record_ledger_call(chain: Chain, call: &str, ok: bool) {
    LEDGER_CALLS
        .with_label_values(&[chain.as_str(), call, if ok { "ok" } else { "error" }])
        .inc();
}

pub fn record_reconcile_pass(ok: bool) {
    RECONCILE_PASSES
        .with_label_values(&[if ok { "ok" } else { "error" }])
        .inc();
}

pub fn record_request_stats(stats: &RequestStats) {
    for (state, count) in stats.iter() {
        REQUESTS_BY_STATE
            .with_label_values(&[state.as_str()])
            .set(count as f64);
    }
}
