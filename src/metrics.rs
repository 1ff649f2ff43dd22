// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for cart-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cart_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: ephemeral, durable, saved
//! - `operation`: get, set, save, recover, associate, ...
//! - `status`: success, hit, miss, error, skipped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a tier operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "cart_engine_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "cart_engine_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error with its classification
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "cart_engine_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a backend connection failure
pub fn record_connection_error(backend: &str) {
    counter!(
        "cart_engine_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Set backend health (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "cart_engine_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE-BEHIND - Durable replication queue
// ═══════════════════════════════════════════════════════════════════════════

/// Record a write-behind outcome: enqueued, dropped, succeeded, failed, skipped
pub fn record_write_behind(outcome: &str) {
    counter!(
        "cart_engine_write_behind_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the number of snapshots waiting for the worker
pub fn set_write_behind_depth(depth: usize) {
    gauge!("cart_engine_write_behind_depth").set(depth as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE EVENTS - Recovery, merge, conversion, scans
// ═══════════════════════════════════════════════════════════════════════════

/// Record a recovery attempt (recovered, miss, error)
pub fn record_recovery(status: &str) {
    counter!(
        "cart_engine_recoveries_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a guest/user association (merged, adopted, tagged, empty)
pub fn record_merge(kind: &str) {
    counter!(
        "cart_engine_merges_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a conversion outcome (converted, already_converted, not_found)
pub fn record_conversion(outcome: &str) {
    counter!(
        "cart_engine_conversions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record carts found by an abandonment scan
pub fn record_abandoned_found(count: usize) {
    counter!("cart_engine_abandoned_found_total").increment(count as u64);
}

/// Record abandoned-cart notifications by delivery status
pub fn record_abandoned_notified(status: &str) {
    counter!(
        "cart_engine_abandoned_notified_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record converted carts deleted by the retention sweep
pub fn record_retention_deleted(count: u64) {
    counter!("cart_engine_retention_deleted_total").increment(count);
}

/// Record a scheduled scan run
pub fn record_scan(scan: &str, duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "cart_engine_scans_total",
        "scan" => scan.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "cart_engine_scan_seconds",
        "scan" => scan.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// STARTUP - Timing for cold start monitoring
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "cart_engine_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("cart_engine_startup_total_seconds").record(duration.as_secs_f64());
}

/// Track engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "cart_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
