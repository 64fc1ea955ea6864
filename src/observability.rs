use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "salonbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "salonbook_query_duration_seconds";

/// Counter: engine mutations. Labels: op, outcome (`committed` or an error kind).
pub const MUTATIONS_TOTAL: &str = "salonbook_mutations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "salonbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "salonbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "salonbook_connections_rejected_total";

/// Gauge: number of loaded salons.
pub const TENANTS_ACTIVE: &str = "salonbook_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "salonbook_auth_failures_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "salonbook_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "salonbook_journal_flush_batch_size";

// ── Maintenance ─────────────────────────────────────────────────

/// Counter: appointments the sweeper marked as no-show.
pub const NO_SHOWS_TOTAL: &str = "salonbook_no_shows_total";

/// Counter: journal compactions completed.
pub const COMPACTIONS_TOTAL: &str = "salonbook_compactions_total";

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
        Command::InsertStaff { .. } => "insert_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::InsertWorkingHours { .. } => "insert_working_hours",
        Command::InsertService { .. } => "insert_service",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::InsertReschedule { .. } => "insert_reschedule",
        Command::InsertStatusChange { .. } => "insert_status_change",
        Command::SelectStaff => "select_staff",
        Command::SelectServices => "select_services",
        Command::SelectUnassigned => "select_unassigned",
        Command::SelectTimeline { .. } => "select_timeline",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots(_) => "select_slots",
        Command::SelectSuggestions(_) => "select_suggestions",
        Command::SelectUtilization { .. } => "select_utilization",
        Command::SelectDailyCounts { .. } => "select_daily_counts",
    }
}
