//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status
//! - Scanned, relayed and deferred transfers per direction
//! - Cycle outcomes and durations

use crate::chain::{ChainProvider, ChainRpc};
use crate::error::{FederatorError, FederatorResult};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "federator_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref SOURCE_HEAD: GaugeVec = register_gauge_vec!(
        "federator_source_head_block",
        "Source chain head seen by the last cycle",
        &["direction"]
    ).unwrap();

    pub static ref CHECKPOINT_BLOCK: GaugeVec = register_gauge_vec!(
        "federator_checkpoint_block",
        "Last persisted checkpoint",
        &["direction"]
    ).unwrap();

    pub static ref FEDERATOR_STATE: GaugeVec = register_gauge_vec!(
        "federator_state",
        "Federator state (0=idle 1=scanning 2=evaluating 3=relaying 4=checkpointing 5=aborted)",
        &["direction"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_SCANNED: CounterVec = register_counter_vec!(
        "federator_events_scanned_total",
        "Cross events read from the source chain",
        &["direction"]
    ).unwrap();

    pub static ref EVENTS_DEFERRED: CounterVec = register_counter_vec!(
        "federator_events_deferred_total",
        "Events deferred for lack of confirmations",
        &["direction"]
    ).unwrap();

    pub static ref EVENTS_INVALID: CounterVec = register_counter_vec!(
        "federator_events_invalid_total",
        "Malformed events skipped",
        &["direction"]
    ).unwrap();

    // Transfer metrics
    pub static ref TRANSFERS_RELAYED: CounterVec = register_counter_vec!(
        "federator_transfers_relayed_total",
        "Transfers accepted on the destination chain",
        &["direction"]
    ).unwrap();

    pub static ref TRANSFERS_PROPOSED: CounterVec = register_counter_vec!(
        "federator_transfers_proposed_total",
        "Transfers proposed to the destination multisig",
        &["direction"]
    ).unwrap();

    pub static ref TRANSFERS_ALREADY_PROCESSED: CounterVec = register_counter_vec!(
        "federator_transfers_already_processed_total",
        "Transfers skipped because the destination had processed them",
        &["direction"]
    ).unwrap();

    // Cycle metrics
    pub static ref CYCLE_ABORTS: CounterVec = register_counter_vec!(
        "federator_cycle_aborts_total",
        "Cycles aborted by error kind",
        &["direction", "kind"]
    ).unwrap();

    pub static ref CYCLE_DURATION: HistogramVec = register_histogram_vec!(
        "federator_cycle_duration_seconds",
        "Duration of one federator cycle",
        &["direction"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref TICKS_SKIPPED: CounterVec = register_counter_vec!(
        "federator_ticks_skipped_total",
        "Scheduler ticks skipped because a cycle was still running",
        &[]
    ).unwrap();
}

#[derive(Clone)]
struct ServerState {
    providers: Arc<Vec<Arc<ChainProvider>>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    name: String,
    healthy: bool,
}

/// Prometheus metrics server with liveness and readiness routes
pub struct MetricsServer {
    port: u16,
    providers: Vec<Arc<ChainProvider>>,
}

impl MetricsServer {
    pub fn new(port: u16, providers: Vec<Arc<ChainProvider>>) -> Self {
        Self { port, providers }
    }

    pub async fn run(self) -> FederatorResult<()> {
        let state = ServerState {
            providers: Arc::new(self.providers),
        };
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| FederatorError::Internal(format!("cannot bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| FederatorError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Liveness: the process is up
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: every chain answers
async fn readiness_check(State(state): State<ServerState>) -> impl IntoResponse {
    let mut chains = Vec::with_capacity(state.providers.len());
    for provider in state.providers.iter() {
        let healthy = provider.health_check().await;
        record_chain_health(provider.chain_id(), healthy);
        chains.push(ChainHealth {
            chain_id: provider.chain_id(),
            name: provider.name().to_string(),
            healthy,
        });
    }

    let ready = chains.iter().all(|c| c.healthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, chains }))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_source_head(direction: &str, head: u64) {
    SOURCE_HEAD.with_label_values(&[direction]).set(head as f64);
}

pub fn record_checkpoint(direction: &str, block: u64) {
    CHECKPOINT_BLOCK.with_label_values(&[direction]).set(block as f64);
}

pub fn record_state(direction: &str, code: u8) {
    FEDERATOR_STATE
        .with_label_values(&[direction])
        .set(f64::from(code));
}

pub fn record_events_scanned(direction: &str, count: usize) {
    EVENTS_SCANNED
        .with_label_values(&[direction])
        .inc_by(count as f64);
}

pub fn record_deferred(direction: &str) {
    EVENTS_DEFERRED.with_label_values(&[direction]).inc();
}

pub fn record_invalid(direction: &str) {
    EVENTS_INVALID.with_label_values(&[direction]).inc();
}

pub fn record_relayed(direction: &str) {
    TRANSFERS_RELAYED.with_label_values(&[direction]).inc();
}

pub fn record_proposed(direction: &str) {
    TRANSFERS_PROPOSED.with_label_values(&[direction]).inc();
}

pub fn record_already_processed(direction: &str) {
    TRANSFERS_ALREADY_PROCESSED
        .with_label_values(&[direction])
        .inc();
}

pub fn record_abort(direction: &str, kind: &str) {
    CYCLE_ABORTS.with_label_values(&[direction, kind]).inc();
}

pub fn record_cycle_duration(direction: &str, secs: f64) {
    CYCLE_DURATION.with_label_values(&[direction]).observe(secs);
}

pub fn record_tick_skipped() {
    TICKS_SKIPPED.with_label_values(&[]).inc();
}
