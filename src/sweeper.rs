use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that runs the demerit sweep on a fixed interval.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let report = engine.run_sweep().await;
        debug!(
            "sweep tick: {} reservations, {} sessions scanned",
            report.reservations_scanned, report.sessions_scanned
        );
    }
}

/// Compact once `threshold` appends have piled up. Returns whether it did.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    if engine.wal_appends_since_compact().await < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
