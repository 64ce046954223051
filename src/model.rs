use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// No epsilon: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A booked slot on the gym floor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub start: Ms,
    /// Whole hours, `1..=max_duration_hours`.
    pub duration_hours: u32,
    pub attended: bool,
    pub penalty_processed: bool,
}

impl Reservation {
    pub fn new(id: Ulid, owner_id: Ulid, start: Ms, duration_hours: u32) -> Self {
        Self {
            id,
            owner_id,
            start,
            duration_hours,
            attended: false,
            penalty_processed: false,
        }
    }

    pub fn end(&self) -> Ms {
        self.start + self.duration_hours as Ms * HOUR_MS
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub check_in: Ms,
    pub check_out: Option<Ms>,
    pub penalty_processed: bool,
}

impl AttendanceSession {
    pub fn is_open(&self) -> bool {
        self.check_out.is_none()
    }

    /// Length of a closed session. `None` while still open.
    pub fn duration_ms(&self) -> Option<Ms> {
        self.check_out.map(|out| out - self.check_in)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PenaltyReason {
    NoShow,
    MissingCheckoutAutoClosed,
    OverstayedSession,
}

impl PenaltyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PenaltyReason::NoShow => "no_show",
            PenaltyReason::MissingCheckoutAutoClosed => "missing_checkout_auto_closed",
            PenaltyReason::OverstayedSession => "overstayed_session",
        }
    }
}

impl std::fmt::Display for PenaltyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only demerit ledger entry. The related ids are audit pointers only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyRecord {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub reason: PenaltyReason,
    pub points: u32,
    pub issued_at: Ms,
    pub reservation_id: Option<Ulid>,
    pub session_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspensionSource {
    Manual,
    Automatic,
}

impl SuspensionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspensionSource::Manual => "manual",
            SuspensionSource::Automatic => "automatic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspensionState {
    pub owner_id: Ulid,
    pub active_until: Option<Ms>,
    pub reason: Option<String>,
    pub source: SuspensionSource,
}

impl SuspensionState {
    /// Lapses on its own once `active_until` passes.
    pub fn is_active(&self, now: Ms) -> bool {
        self.active_until.is_some_and(|until| now < until)
    }
}

/// The WAL record format. Flat, no nesting beyond snapshots.
///
/// Transitions that touch more than one record are a single event so they
/// land on disk atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationAdmitted {
        id: Ulid,
        owner_id: Ulid,
        start: Ms,
        duration_hours: u32,
    },
    ReservationModified {
        id: Ulid,
        start: Ms,
        duration_hours: u32,
    },
    ReservationCancelled {
        id: Ulid,
    },
    /// Opens a session and marks the matched reservation attended.
    CheckedIn {
        session_id: Ulid,
        owner_id: Ulid,
        reservation_id: Ulid,
        at: Ms,
    },
    CheckedOut {
        session_id: Ulid,
        owner_id: Ulid,
        at: Ms,
    },
    ReservationScored {
        id: Ulid,
        penalty: Option<PenaltyRecord>,
    },
    SessionScored {
        id: Ulid,
        owner_id: Ulid,
        auto_closed_at: Option<Ms>,
        penalty: Option<PenaltyRecord>,
    },
    SuspensionApplied {
        owner_id: Ulid,
        active_until: Ms,
        reason: String,
        source: SuspensionSource,
    },
    SuspensionRemoved {
        owner_id: Ulid,
    },
    // Compaction snapshots
    ReservationRestored(Reservation),
    SessionRestored(AttendanceSession),
    PenaltyRestored(PenaltyRecord),
}

// ── Query result types ───────────────────────────────────────────

/// Reservations in a 7-day window, split at the query instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekView {
    pub window: Span,
    pub past: Vec<Reservation>,
    pub upcoming: Vec<Reservation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInStatus {
    CheckedIn(AttendanceSession),
    CheckedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    pub record_id: Ulid,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reservations_scanned: usize,
    pub sessions_scanned: usize,
    pub auto_closed: usize,
    pub penalties_issued: usize,
    pub suspensions_applied: usize,
    pub failures: Vec<SweepFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemeritSummary {
    pub owner_id: Ulid,
    pub total_points: u32,
    pub points_by_reason: BTreeMap<PenaltyReason, u32>,
    /// Newest first.
    pub records: Vec<PenaltyRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub count: usize,
    pub points: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PenaltyStats {
    pub total_records: usize,
    pub total_points: u32,
    pub by_reason: BTreeMap<PenaltyReason, Tally>,
    pub by_owner: BTreeMap<Ulid, Tally>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionDecision {
    pub owner_id: Ulid,
    /// Points issued inside the trailing window.
    pub points: u32,
    pub suspend_days: Option<u32>,
    pub until: Option<Ms>,
    pub reason: Option<String>,
}

impl SuspensionDecision {
    pub fn suspends(&self) -> bool {
        self.suspend_days.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionStatus {
    pub suspended: bool,
    pub state: Option<SuspensionState>,
    /// Zero when not suspended.
    pub remaining_ms: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn reservation_end_follows_duration() {
        let r = Reservation::new(Ulid::new(), Ulid::new(), 9 * HOUR_MS, 2);
        assert_eq!(r.end(), 11 * HOUR_MS);
        assert_eq!(r.span(), Span::new(9 * HOUR_MS, 11 * HOUR_MS));
        assert!(!r.attended);
        assert!(!r.penalty_processed);
    }

    #[test]
    fn session_duration_only_when_closed() {
        let mut s = AttendanceSession {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            check_in: 1_000,
            check_out: None,
            penalty_processed: false,
        };
        assert!(s.is_open());
        assert_eq!(s.duration_ms(), None);
        s.check_out = Some(4_000);
        assert!(!s.is_open());
        assert_eq!(s.duration_ms(), Some(3_000));
    }

    #[test]
    fn suspension_lapses_without_state_change() {
        let state = SuspensionState {
            owner_id: Ulid::new(),
            active_until: Some(10_000),
            reason: Some("manual".into()),
            source: SuspensionSource::Manual,
        };
        assert!(state.is_active(9_999));
        assert!(!state.is_active(10_000));
        assert!(!state.is_active(50_000));

        let cleared = SuspensionState {
            active_until: None,
            ..state
        };
        assert!(!cleared.is_active(0));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SessionScored {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            auto_closed_at: Some(5 * HOUR_MS),
            penalty: Some(PenaltyRecord {
                id: Ulid::new(),
                owner_id: Ulid::new(),
                reason: PenaltyReason::MissingCheckoutAutoClosed,
                points: 1,
                issued_at: 5 * HOUR_MS,
                reservation_id: None,
                session_id: Some(Ulid::new()),
            }),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
