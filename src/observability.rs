use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotd_request_duration_seconds";

/// Counter: booking decisions. Labels: outcome (ok/rejected/unavailable/failed).
pub const BOOKINGS_TOTAL: &str = "slotd_bookings_total";

/// Counter: cancellation decisions. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "slotd_cancellations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Counter: failed hello handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "slotd_auth_failures_total";

/// Counter: slot lock waits that timed out after all retries.
pub const LOCK_TIMEOUTS_TOTAL: &str = "slotd_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

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
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::ListSlots { .. } => "list_slots",
        Request::Snapshot => "snapshot",
        Request::Book { .. } => "book",
        Request::Cancel { .. } => "cancel",
        Request::MyBooking => "my_booking",
        Request::CreateSlot { .. } => "create_slot",
        Request::CreateSlotSeries { .. } => "create_slot_series",
        Request::UpdateSlot { .. } => "update_slot",
        Request::SetSlotOpen { .. } => "set_slot_open",
        Request::DeleteSlot { .. } => "delete_slot",
        Request::SlotBookings { .. } => "slot_bookings",
        Request::Subscribe { .. } => "subscribe",
    }
}
