use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "appointd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "appointd_query_duration_seconds";

/// Counter: admission attempts that reached the facility lock. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "appointd_admissions_total";

/// Counter: slot listings computed.
pub const SLOT_QUERIES_TOTAL: &str = "appointd_slot_queries_total";

/// Counter: lifecycle transitions applied. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "appointd_status_transitions_total";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "appointd_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "appointd_connections_total";

/// Counter: connections turned away at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "appointd_connections_rejected_total";

/// Gauge: facilities loaded.
pub const FACILITIES_ACTIVE: &str = "appointd_facilities_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "appointd_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "appointd_wal_flush_batch_size";

/// Install the Prometheus exporter. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::InsertHours { .. } => "insert_hours",
        Command::InsertService { .. } => "insert_service",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectFacilities => "select_facilities",
        Command::SelectServices { .. } => "select_services",
    }
}
