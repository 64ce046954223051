use std::net::SocketAddr;

use crate::engine::Rejection;

// ── Request-driven ──────────────────────────────────────────────

/// Counter: admission and modification outcomes. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "gymkeep_admissions_total";

/// Counter: check-in outcomes. Labels: outcome.
pub const CHECKINS_TOTAL: &str = "gymkeep_checkins_total";

// ── Sweep ───────────────────────────────────────────────────────

/// Counter: penalty records issued. Labels: reason.
pub const PENALTIES_ISSUED_TOTAL: &str = "gymkeep_penalties_issued_total";

/// Histogram: wall time of one demerit sweep in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "gymkeep_sweep_duration_seconds";

/// Counter: records a sweep could not score.
pub const SWEEP_FAILURES_TOTAL: &str = "gymkeep_sweep_failures_total";

/// Counter: suspensions written. Labels: source.
pub const SUSPENSIONS_APPLIED_TOTAL: &str = "gymkeep_suspensions_applied_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gymkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gymkeep_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
/// A failed install is logged and the daemon runs without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Short label for a rejection, used as the `outcome` metric label.
pub fn rejection_label(rejection: &Rejection) -> &'static str {
    match rejection {
        Rejection::SelfOverlap(_) => "self_overlap",
        Rejection::DailyLimitReached(_) => "daily_limit",
        Rejection::CapacityExceeded(_) => "capacity",
        Rejection::LockedWindow => "locked",
        Rejection::NotFound(_) => "not_found",
        Rejection::NotOwner(_) => "not_owner",
        Rejection::NoActiveBooking => "no_active_booking",
        Rejection::AlreadyCheckedIn(_) => "already_checked_in",
        Rejection::NotCheckedIn => "not_checked_in",
    }
}
