use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::EnvFilter;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests handled. Labels: method, status.
pub const HTTP_REQUESTS_TOTAL: &str = "slotbook_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "slotbook_http_request_duration_seconds";

/// Counter: requests turned away because the in-flight limit was reached.
pub const HTTP_REJECTED_TOTAL: &str = "slotbook_http_rejected_total";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: bookings committed by the conflict guard. Labels: kind.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "slotbook_bookings_committed_total";

/// Counter: conflict reasons seen at commit time. Labels: reason.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotbook_booking_conflicts_total";

/// Counter: bookings committed through the overbooking override.
pub const OVERBOOKINGS_TOTAL: &str = "slotbook_overbookings_total";

/// Counter: slots produced by generation requests. Labels: scope.
pub const SLOTS_GENERATED_TOTAL: &str = "slotbook_slots_generated_total";

/// Histogram: slot generation latency in seconds.
pub const SLOT_GENERATION_DURATION_SECONDS: &str = "slotbook_slot_generation_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// `RUST_LOG` wins over the configured filter when set.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
