use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire requests handled. Labels: op.
pub const REQUESTS_TOTAL: &str = "slotbook_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotbook_request_duration_seconds";

/// Counter: bookings successfully created.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotbook_bookings_created_total";

/// Counter: booking attempts lost to continuity/lock conflicts.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotbook_booking_conflicts_total";

/// Counter: sweep status transitions. Labels: outcome (finished|expired).
pub const SWEEP_TRANSITIONS_TOTAL: &str = "slotbook_sweep_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Counter: failed session handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn request_label(request: &Request) -> &'static str {
    match request {
        Request::Hello { .. } => "hello",
        Request::RegisterTutor => "register_tutor",
        Request::SetAvailability { .. } => "set_availability",
        Request::GetAvailability { .. } => "get_availability",
        Request::CreateBooking { .. } => "create_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::ConfirmBooking { .. } => "confirm_booking",
        Request::RejectBooking { .. } => "reject_booking",
        Request::ListBookings { .. } => "list_bookings",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
        Request::UnlistenAll => "unlisten_all",
    }
}
