//! Prometheus metrics for the fleet orchestrator
//!
//! This module provides metrics tracking for:
//! - Provisioning outcomes and placement
//! - Ban propagation and remote revocations
//! - Reconciliation cycles, expiry and orphan sweeps
//! - Per-node load and reachability gauges
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

use crate::models::NodeId;

// ============================================================================
// Metrics Storage
// ============================================================================

struct FleetMetrics {
    provisions: CounterVec,
    bans: CounterVec,
    revocations: CounterVec,
    reconcile_cycles: CounterVec,
    reconcile_duration: HistogramVec,
    expired_credentials: Counter,
    swept_orphans: Counter,
    active_credentials: Gauge,
    node_load: GaugeVec,
    node_reachable: GaugeVec,
    api_requests: CounterVec,
}

static FLEET_METRICS: OnceLock<FleetMetrics> = OnceLock::new();

/// Outcome of the first initialization; concurrent callers wait on it
static METRICS_INIT: OnceLock<Result<(), String>> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once. If registration fails, subsequent metric
/// operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = gatefleet::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics initialization failed");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    METRICS_INIT
        .get_or_init(|| register_metrics().map_err(|e| e.to_string()))
        .clone()
        .map_err(Into::into)
}

fn register_metrics() -> Result<(), prometheus::Error> {
    let metrics = FleetMetrics {
        provisions: register_counter_vec!(
            "gatefleet_provisions_total",
            "Provisioning requests by outcome",
            &["outcome"]
        )?,
        bans: register_counter_vec!(
            "gatefleet_bans_total",
            "Ban requests by scope",
            &["scope"]
        )?,
        revocations: register_counter_vec!(
            "gatefleet_revocations_total",
            "Remote credential revocations by result",
            &["result"]
        )?,
        reconcile_cycles: register_counter_vec!(
            "gatefleet_reconcile_cycles_total",
            "Reconciliation cycles by result",
            &["result"]
        )?,
        reconcile_duration: register_histogram_vec!(
            "gatefleet_reconcile_duration_seconds",
            "Reconciliation cycle duration in seconds",
            &["result"],
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )?,
        expired_credentials: register_counter!(
            "gatefleet_expired_credentials_total",
            "Credentials deactivated by the expiry sweep"
        )?,
        swept_orphans: register_counter!(
            "gatefleet_swept_orphans_total",
            "Remote credentials deleted by the reverse sweep"
        )?,
        active_credentials: register_gauge!(
            "gatefleet_active_credentials",
            "Active credentials in the ledger"
        )?,
        node_load: register_gauge_vec!(
            "gatefleet_node_load",
            "Active credentials per node",
            &["node"]
        )?,
        node_reachable: register_gauge_vec!(
            "gatefleet_node_reachable",
            "Whether the node answered its last probe (1 = yes, 0 = no)",
            &["node"]
        )?,
        api_requests: register_counter_vec!(
            "gatefleet_api_requests_total",
            "Total API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
    };

    if FLEET_METRICS.set(metrics).is_err() {
        return Err(prometheus::Error::AlreadyReg);
    }

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    FLEET_METRICS.get().is_some()
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// Recorders
// ============================================================================

/// Record a provisioning outcome ("ok", "no_capacity", "banned", ...)
pub fn record_provision(outcome: &str) {
    if let Some(m) = FLEET_METRICS.get() {
        m.provisions.with_label_values(&[outcome]).inc();
    }
}

pub fn record_ban(scope: &str) {
    if let Some(m) = FLEET_METRICS.get() {
        m.bans.with_label_values(&[scope]).inc();
    }
}

/// Record one remote revocation attempt
pub fn record_revocation(success: bool) {
    if let Some(m) = FLEET_METRICS.get() {
        let result = if success { "ok" } else { "failed" };
        m.revocations.with_label_values(&[result]).inc();
    }
}

pub fn record_reconcile_cycle(clean: bool, duration_secs: f64, expired: usize, swept: usize) {
    let Some(m) = FLEET_METRICS.get() else {
        return;
    };

    let result = if clean { "ok" } else { "partial" };
    m.reconcile_cycles.with_label_values(&[result]).inc();
    m.reconcile_duration
        .with_label_values(&[result])
        .observe(duration_secs);
    m.expired_credentials.inc_by(expired as f64);
    m.swept_orphans.inc_by(swept as f64);
}

pub fn set_active_credentials(count: u64) {
    if let Some(m) = FLEET_METRICS.get() {
        m.active_credentials.set(count as f64);
    }
}

pub fn set_node_state(node: NodeId, load: u32, reachable: bool) {
    let Some(m) = FLEET_METRICS.get() else {
        return;
    };

    let label = node.to_string();
    m.node_load.with_label_values(&[label.as_str()]).set(f64::from(load));
    m.node_reachable
        .with_label_values(&[label.as_str()])
        .set(if reachable { 1.0 } else { 0.0 });
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16) {
    if let Some(m) = FLEET_METRICS.get() {
        let status_str = status.to_string();
        m.api_requests
            .with_label_values(&[endpoint, status_str.as_str()])
            .inc();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        let _ = init_metrics();
        record_provision("ok");
        record_ban("global");
        set_node_state(NodeId(1), 3, true);

        let text = encode_metrics().unwrap();
        assert!(text.contains("gatefleet_provisions_total"));
        assert!(text.contains("gatefleet_node_load"));
    }

    #[test]
    fn test_recorders_do_not_panic() {
        record_revocation(true);
        record_revocation(false);
        record_reconcile_cycle(true, 0.2, 3, 1);
        set_active_credentials(10);
        record_api_request("/api/stats", 200);
    }
}
