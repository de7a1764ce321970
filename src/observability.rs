use std::net::SocketAddr;

use crate::model::Event;

// ── Lifecycle metrics ───────────────────────────────────────────

/// Counter: events applied to engine state. Labels: event.
pub const EVENTS_APPLIED_TOTAL: &str = "labsched_events_applied_total";

/// Counter: bookings and reschedules refused because of a conflict.
pub const CONFLICTS_TOTAL: &str = "labsched_conflicts_total";

/// Counter: reservations ended by another start on the same channel.
pub const DISPLACEMENTS_TOTAL: &str = "labsched_displacements_total";

/// Counter: reservations ended by the auto-expire sweep.
pub const AUTO_EXPIRED_TOTAL: &str = "labsched_auto_expired_total";

/// Counter: sweep items that failed and were skipped.
pub const SWEEP_FAILURES_TOTAL: &str = "labsched_sweep_failures_total";

/// Histogram: auto-expire sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "labsched_sweep_duration_seconds";

// ── Collaborator metrics ────────────────────────────────────────

/// Counter: failed device commands and status probes.
pub const DEVICE_ERRORS_TOTAL: &str = "labsched_device_errors_total";

/// Counter: failed order completions.
pub const ORDER_ERRORS_TOTAL: &str = "labsched_order_errors_total";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL append + fsync duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labsched_wal_flush_duration_seconds";

/// Gauge: resources loaded in the engine.
pub const RESOURCES_ACTIVE: &str = "labsched_resources_active";

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

/// Map an Event variant to a short label for metrics.
pub fn event_label(event: &Event) -> &'static str {
    match event {
        Event::ResourceCreated { .. } => "resource_created",
        Event::ResourceUpdated { .. } => "resource_updated",
        Event::RuleAdded { .. } => "rule_added",
        Event::RuleUpdated { .. } => "rule_updated",
        Event::RuleRemoved { .. } => "rule_removed",
        Event::ReservationBooked { .. } => "reservation_booked",
        Event::ReservationRescheduled { .. } => "reservation_rescheduled",
        Event::ReservationStarted { .. } => "reservation_started",
        Event::ReservationEnded { .. } => "reservation_ended",
        Event::ReservationCanceled { .. } => "reservation_canceled",
        Event::ActualsCorrected { .. } => "actuals_corrected",
    }
}
