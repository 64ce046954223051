use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::format_instant;
use crate::config::EngineConfig;
use crate::model::*;
use crate::observability::{CHECKINS_TOTAL, rejection_label};

use super::index::SlotIndex;
use super::{Engine, EngineError, Rejection, SharedAttendance};

/// One owner's sessions in check-in order, with the open one tracked directly.
#[derive(Debug, Default)]
pub struct OwnerAttendance {
    sessions: Vec<AttendanceSession>,
    open_id: Option<Ulid>,
}

impl OwnerAttendance {
    pub fn sessions(&self) -> &[AttendanceSession] {
        &self.sessions
    }

    pub fn open_session(&self) -> Option<&AttendanceSession> {
        self.open_id.and_then(|id| self.get(&id))
    }

    pub fn get(&self, id: &Ulid) -> Option<&AttendanceSession> {
        self.sessions.iter().rev().find(|s| s.id == *id)
    }

    pub(super) fn get_mut(&mut self, id: &Ulid) -> Option<&mut AttendanceSession> {
        self.sessions.iter_mut().rev().find(|s| s.id == *id)
    }

    pub(super) fn begin(&mut self, session: AttendanceSession) {
        self.open_id = Some(session.id);
        self.sessions.push(session);
    }

    pub(super) fn close(&mut self, id: &Ulid, at: Ms) {
        if let Some(s) = self.get_mut(id)
            && s.check_out.is_none()
        {
            s.check_out = Some(at);
        }
        if self.open_id == Some(*id) {
            self.open_id = None;
        }
    }

    pub(super) fn restore(&mut self, session: AttendanceSession) {
        if session.is_open() {
            self.open_id = Some(session.id);
        }
        self.sessions.push(session);
    }
}

/// The owner's reservation whose check-in window contains `now`:
/// `start - before <= now <= start + after`. Unattended and nearest first.
fn check_in_target(
    slots: &SlotIndex,
    config: &EngineConfig,
    owner_id: Ulid,
    now: Ms,
) -> Option<Reservation> {
    let earliest = now - config.check_in_after_ms;
    let latest = now + config.check_in_before_ms;
    slots
        .owner_reservations(owner_id)
        .into_iter()
        .filter(|r| (earliest..=latest).contains(&r.start))
        .min_by_key(|r| (r.attended, (r.start - now).abs()))
        .cloned()
}

fn count_check_in(outcome: &'static str) {
    metrics::counter!(CHECKINS_TOTAL, "outcome" => outcome).increment(1);
}

fn reject(rejection: Rejection) -> EngineError {
    count_check_in(rejection_label(&rejection));
    rejection.into()
}

impl Engine {
    fn existing_attendance(&self, owner_id: &Ulid) -> Option<SharedAttendance> {
        self.attendance.get(owner_id).map(|e| e.value().clone())
    }

    /// Open a session against the reservation whose check-in window is now,
    /// and mark that reservation attended.
    pub async fn check_in(&self, owner_id: Ulid) -> Result<AttendanceSession, EngineError> {
        let now = self.clock.now();
        let mut slots = self.slots.write().await;
        let shared = self.attendance_for(owner_id);
        let mut att = shared.write().await;

        let Some(reservation) = check_in_target(&slots, &self.config, owner_id, now) else {
            debug!("check-in for {owner_id} at {} has no booking", format_instant(now));
            return Err(reject(Rejection::NoActiveBooking));
        };
        if let Some(open) = att.open_session() {
            return Err(reject(Rejection::AlreadyCheckedIn(open.id)));
        }

        let session = AttendanceSession {
            id: Ulid::new(),
            owner_id,
            check_in: now,
            check_out: None,
            penalty_processed: false,
        };
        let event = Event::CheckedIn {
            session_id: session.id,
            owner_id,
            reservation_id: reservation.id,
            at: now,
        };
        self.persist_check_in(&mut slots, &mut att, &event).await?;
        count_check_in("checked_in");
        info!(
            "{owner_id} checked in for reservation {} (session {})",
            reservation.id, session.id
        );
        Ok(session)
    }

    pub async fn check_out(&self, owner_id: Ulid) -> Result<AttendanceSession, EngineError> {
        let shared = self
            .existing_attendance(&owner_id)
            .ok_or(Rejection::NotCheckedIn)?;
        let mut att = shared.write().await;
        let open = att
            .open_session()
            .cloned()
            .ok_or(Rejection::NotCheckedIn)?;

        let now = self.clock.now();
        let event = Event::CheckedOut {
            session_id: open.id,
            owner_id,
            at: now,
        };
        self.persist_attendance(&mut att, &event).await?;
        info!("{owner_id} checked out (session {})", open.id);
        Ok(AttendanceSession {
            check_out: Some(now),
            ..open
        })
    }

    pub async fn check_in_status(&self, owner_id: Ulid) -> CheckInStatus {
        let Some(shared) = self.existing_attendance(&owner_id) else {
            return CheckInStatus::CheckedOut;
        };
        let att = shared.read().await;
        match att.open_session() {
            Some(s) => CheckInStatus::CheckedIn(s.clone()),
            None => CheckInStatus::CheckedOut,
        }
    }

    pub async fn session(&self, session_id: Ulid) -> Result<AttendanceSession, EngineError> {
        let owner = self
            .session_owner
            .get(&session_id)
            .map(|e| *e.value())
            .ok_or(Rejection::NotFound(session_id))?;
        let shared = self
            .existing_attendance(&owner)
            .ok_or(Rejection::NotFound(session_id))?;
        let att = shared.read().await;
        att.get(&session_id)
            .cloned()
            .ok_or_else(|| Rejection::NotFound(session_id).into())
    }

    fn attendance_handles(&self) -> Vec<SharedAttendance> {
        self.attendance.iter().map(|e| e.value().clone()).collect()
    }

    /// Every session, newest check-in first.
    pub async fn all_sessions(&self) -> Vec<AttendanceSession> {
        let mut sessions = Vec::new();
        for shared in self.attendance_handles() {
            sessions.extend(shared.read().await.sessions().iter().cloned());
        }
        sessions.sort_by(|a, b| b.check_in.cmp(&a.check_in));
        sessions
    }

    /// Number of owners currently on the floor.
    pub async fn current_population(&self) -> usize {
        let mut count = 0;
        for shared in self.attendance_handles() {
            if shared.read().await.open_session().is_some() {
                count += 1;
            }
        }
        count
    }
}
