//! Metrics collection and exposition.
//!
//! # Metrics
//! - `admission_throttle_rejected_total` (counter): 503s from a full backlog
//! - `admission_throttle_abandoned_total` (counter): waits cut off by the deadline
//! - `admission_throttle_backlog` (gauge): requests waiting for a token
//! - `admission_rate_limited_total` (counter): 429s
//! - `admission_store_errors_total` (counter): rate-limit store failures
//! - `admission_idempotency_total` (counter): by `outcome`
//! - `admission_nollamas_total` (counter): by `outcome`

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_throttle_rejected() {
    counter!("admission_throttle_rejected_total").increment(1);
}

pub fn record_throttle_abandoned() {
    counter!("admission_throttle_abandoned_total").increment(1);
}

pub fn record_backlog(waiting: usize) {
    gauge!("admission_throttle_backlog").set(waiting as f64);
}

pub fn record_rate_limited() {
    counter!("admission_rate_limited_total").increment(1);
}

pub fn record_store_error() {
    counter!("admission_store_errors_total").increment(1);
}

/// `outcome` is one of `fresh`, `conflict`, `replayed`.
pub fn record_idempotency(outcome: &'static str) {
    counter!("admission_idempotency_total", "outcome" => outcome).increment(1);
}

/// `outcome` is one of `challenged`, `passed`, `solved`, `failed`, `bypassed`.
pub fn record_nollamas(outcome: &'static str) {
    counter!("admission_nollamas_total", "outcome" => outcome).increment(1);
}
