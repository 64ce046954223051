use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

/// Malformed input. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duration must be between 1 and {max} hours, got {hours}")]
    DurationOutOfRange { hours: u32, max: u32 },
    #[error("nothing to modify")]
    EmptyModification,
    #[error("unparsable date: {0:?}")]
    InvalidDate(String),
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(Ms),
    #[error("suspension length must be between 1 and {max} days, got {days}")]
    SuspensionLength { days: u32, max: u32 },
    #[error("suspension reason must be 1..={max} bytes")]
    SuspensionReason { max: usize },
}

/// A named business outcome. The caller decides what to do next.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("owner already holds overlapping reservation {0}")]
    SelfOverlap(Ulid),
    #[error("daily limit of {0} reservations reached")]
    DailyLimitReached(u32),
    #[error("capacity {0} exceeded: slot fully booked")]
    CapacityExceeded(u32),
    #[error("reservation starts too soon to change")]
    LockedWindow,
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("reservation {0} belongs to another owner")]
    NotOwner(Ulid),
    #[error("no reservation within the check-in window")]
    NoActiveBooking,
    #[error("already checked in (session {0})")]
    AlreadyCheckedIn(Ulid),
    #[error("not checked in")]
    NotCheckedIn,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Invalid(#[from] ValidationError),
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),
    /// Storage failure. State is unchanged and the whole operation may be retried.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            EngineError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}
