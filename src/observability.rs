use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roost_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roost_query_duration_seconds";

// ── Domain counters ─────────────────────────────────────────────

/// Counter: bookings accepted.
pub const BOOKINGS_CREATED_TOTAL: &str = "roost_bookings_created_total";

/// Counter: booking requests refused because the dates were taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roost_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roost_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roost_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roost_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "roost_tenants_active";

/// Counter: WAL compactions run. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "roost_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roost_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roost_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::InsertProperty { .. } => "insert_property",
        Command::UpdateProperty { .. } => "update_property",
        Command::InsertPropertyImage { .. } => "insert_property_image",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::SelectProperty { .. } => "select_property",
        Command::SelectProperties { .. } => "select_properties",
        Command::SelectPropertyDetail { .. } => "select_property_detail",
        Command::SelectPropertyBookings { .. } => "select_property_bookings",
        Command::SelectGuestBookings { .. } => "select_guest_bookings",
        Command::SelectGuestStatistics { .. } => "select_guest_statistics",
        Command::SelectDashboard { .. } => "select_dashboard",
    }
}
