use ulid::Ulid;

use crate::calendar::day_window;
use crate::config::EngineConfig;
use crate::model::*;

use super::index::SlotIndex;
use super::{Rejection, ValidationError};

pub(crate) fn validate_instant(t: Ms) -> Result<(), ValidationError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(ValidationError::TimestampOutOfRange(t));
    }
    Ok(())
}

pub(crate) fn validate_duration(config: &EngineConfig, hours: u32) -> Result<(), ValidationError> {
    if hours == 0 || hours > config.max_duration_hours {
        return Err(ValidationError::DurationOutOfRange {
            hours,
            max: config.max_duration_hours,
        });
    }
    Ok(())
}

/// Self-overlap, then the daily limit, then floor capacity.
///
/// The caller holds the index write lock, so the answer stays true until it
/// commits. A reservation being rescheduled must already be out of the index.
pub(crate) fn check_admission(
    index: &SlotIndex,
    config: &EngineConfig,
    owner: Ulid,
    span: &Span,
) -> Result<(), Rejection> {
    if let Some(existing) = index.owner_overlaps(owner, span).first() {
        return Err(Rejection::SelfOverlap(existing.id));
    }

    let day = day_window(span.start);
    if index.owner_daily_count(owner, &day) >= config.max_daily_bookings as usize {
        return Err(Rejection::DailyLimitReached(config.max_daily_bookings));
    }

    if index.overlap_count(span, None) >= config.max_concurrent_per_slot as usize {
        return Err(Rejection::CapacityExceeded(config.max_concurrent_per_slot));
    }
    Ok(())
}

/// Changes are refused once the start is at most `lockout_ms` away (or past).
pub(crate) fn check_unlocked(
    config: &EngineConfig,
    reservation: &Reservation,
    now: Ms,
) -> Result<(), Rejection> {
    if reservation.start - now <= config.lockout_ms {
        return Err(Rejection::LockedWindow);
    }
    Ok(())
}
