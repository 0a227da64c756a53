use std::net::SocketAddr;

// ── Reconciliation ──────────────────────────────────────────────

/// Counter: reconciliation passes. Labels: outcome (completed, failed, skipped, timed_out).
pub const PASSES_TOTAL: &str = "fleetbook_passes_total";

/// Histogram: wall time of a reconciliation pass in seconds.
pub const PASS_DURATION_SECONDS: &str = "fleetbook_pass_duration_seconds";

/// Counter: applied transitions. Labels: kind.
pub const TRANSITIONS_TOTAL: &str = "fleetbook_transitions_total";

/// Counter: booking records skipped because their schedule did not parse.
pub const RECORDS_SKIPPED_TOTAL: &str = "fleetbook_records_skipped_total";

/// Counter: resources observed with more than one active booking.
pub const ANOMALIES_TOTAL: &str = "fleetbook_anomalies_total";

// ── Notifications ───────────────────────────────────────────────

/// Counter: notifications dropped before delivery (queue full or worker gone).
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "fleetbook_notifications_dropped_total";

/// Counter: notification deliveries that failed. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "fleetbook_notifications_failed_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
