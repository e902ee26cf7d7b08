//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Sequencer queue depths
//! - Message throughput (pushed, sent, replaced, finalized)
//! - Send failures and reverted receipts
//! - Send-to-finalize latency

use crate::error::{DeliveryError, DeliveryResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Queue metrics
    pub static ref MSG_PUSHED: Counter = register_counter!(
        "txd_messages_pushed_total",
        "Total messages pushed into the sequencer"
    ).unwrap();

    pub static ref QUEUED_MSGS: Gauge = register_gauge!(
        "txd_sequencer_queued",
        "Messages waiting on a predecessor"
    ).unwrap();

    pub static ref PENDING_MSGS: Gauge = register_gauge!(
        "txd_sequencer_pending",
        "Released messages waiting to be sent"
    ).unwrap();

    // Transaction metrics
    pub static ref MSG_SENT: CounterVec = register_counter_vec!(
        "txd_messages_sent_total",
        "Total messages broadcast for the first time",
        &["chain_id"]
    ).unwrap();

    pub static ref MSG_REPLACED: CounterVec = register_counter_vec!(
        "txd_messages_replaced_total",
        "Total fee escalation replacements",
        &["chain_id"]
    ).unwrap();

    pub static ref MSG_FINALIZED: CounterVec = register_counter_vec!(
        "txd_messages_finalized_total",
        "Total messages finalized",
        &["chain_id"]
    ).unwrap();

    pub static ref RECEIPT_REVERTED: CounterVec = register_counter_vec!(
        "txd_receipts_reverted_total",
        "Total finalized messages whose execution failed",
        &["chain_id"]
    ).unwrap();

    pub static ref SEND_FAILURES: CounterVec = register_counter_vec!(
        "txd_send_failures_total",
        "Total sends that did not reach the node",
        &["chain_id"]
    ).unwrap();

    pub static ref FINALIZE_LATENCY: HistogramVec = register_histogram_vec!(
        "txd_finalize_latency_seconds",
        "Time from message creation to finalization",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0]
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

    pub async fn run(&self) -> DeliveryResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DeliveryError::Config(format!("Cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| DeliveryError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> DeliveryResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| DeliveryError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| DeliveryError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_msg_pushed() {
    MSG_PUSHED.inc();
}

pub fn record_queue_depths(queued: usize, pending: usize) {
    QUEUED_MSGS.set(queued as f64);
    PENDING_MSGS.set(pending as f64);
}

pub fn record_msg_sent(chain_id: u64) {
    MSG_SENT.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_msg_replaced(chain_id: u64) {
    MSG_REPLACED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_send_failure(chain_id: u64) {
    SEND_FAILURES.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_msg_finalized(chain_id: u64, latency_secs: f64) {
    let label = chain_id.to_string();
    MSG_FINALIZED.with_label_values(&[&label]).inc();
    FINALIZE_LATENCY
        .with_label_values(&[&label])
        .observe(latency_secs);
}

pub fn record_receipt_reverted(chain_id: u64) {
    RECEIPT_REVERTED.with_label_values(&[&chain_id.to_string()]).inc();
}
