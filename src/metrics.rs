/// Metrics and telemetry for the GAL resolver
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Resolution counts, outcomes and latencies
/// - Identity store lookups
/// - Snapshot refreshes
/// - LDAP listener activity

use crate::error::{ResolverError, ResolverResult};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== Resolution Metrics ==========

    /// Dispatched requests by operation and outcome
    pub static ref RESOLUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gal_resolutions_total",
        "Total number of dispatched resolution requests",
        &["operation", "outcome"]
    )
    .unwrap();

    /// Resolution duration in seconds
    pub static ref RESOLUTION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "gal_resolution_duration_seconds",
        "Resolution latencies in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    // ========== Identity Store Metrics ==========

    /// Queries issued against the SQL view
    pub static ref DIRECTORY_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gal_directory_lookups_total",
        "Total number of identity store queries",
        &["kind"]
    )
    .unwrap();

    /// Entries in the current snapshot
    pub static ref SNAPSHOT_ENTRIES: IntGauge = register_int_gauge!(
        "gal_snapshot_entries",
        "Number of directory entries in the current snapshot"
    )
    .unwrap();

    /// Snapshot refreshes by outcome
    pub static ref SNAPSHOT_REFRESHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gal_snapshot_refreshes_total",
        "Total number of snapshot refresh attempts",
        &["outcome"]
    )
    .unwrap();

    // ========== LDAP Metrics ==========

    /// Accepted LDAP connections
    pub static ref LDAP_CONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        "gal_ldap_connections_total",
        "Total number of accepted LDAP connections"
    )
    .unwrap();

    /// LDAP operations by type
    pub static ref LDAP_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gal_ldap_operations_total",
        "Total number of LDAP operations handled",
        &["operation"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> ResolverResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ResolverError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ResolverError::Internal(format!("Metrics are not UTF-8: {}", e)))
}

/// Record a dispatched request
pub fn record_resolution(operation: &str, outcome: &str, duration: f64) {
    RESOLUTIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    RESOLUTION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration);
}

/// Record an LDAP operation
pub fn record_ldap_operation(operation: &str) {
    LDAP_OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
}
