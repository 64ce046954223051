use std::collections::BTreeSet;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{PENALTIES_ISSUED_TOTAL, SWEEP_DURATION_SECONDS, SWEEP_FAILURES_TOTAL};

use super::{Engine, EngineError, SharedAttendance};

fn penalty(
    owner_id: Ulid,
    reason: PenaltyReason,
    issued_at: Ms,
    reservation_id: Option<Ulid>,
    session_id: Option<Ulid>,
) -> PenaltyRecord {
    PenaltyRecord {
        id: Ulid::new(),
        owner_id,
        reason,
        points: 1,
        issued_at,
        reservation_id,
        session_id,
    }
}

/// What the sweep decides for one unprocessed session at `now`.
/// `None` means still in progress: leave it for a later sweep.
fn score_session(
    session: &AttendanceSession,
    max_session_ms: Ms,
    now: Ms,
) -> Option<(Option<Ms>, Option<PenaltyReason>)> {
    match session.check_out {
        None if now - session.check_in > max_session_ms => {
            Some((Some(now), Some(PenaltyReason::MissingCheckoutAutoClosed)))
        }
        None => None,
        Some(out) if out - session.check_in > max_session_ms => {
            Some((None, Some(PenaltyReason::OverstayedSession)))
        }
        Some(_) => Some((None, None)),
    }
}

fn count_penalty(reason: PenaltyReason) {
    metrics::counter!(PENALTIES_ISSUED_TOTAL, "reason" => reason.as_str()).increment(1);
}

impl Engine {
    /// Score every unprocessed reservation and session as of the clock's now.
    pub async fn run_sweep(&self) -> SweepReport {
        self.run_sweep_at(self.clock.now()).await
    }

    /// Idempotent: a record is claimed under its own lock and re-checked before
    /// scoring, so overlapping sweeps never issue a penalty twice. A failing
    /// record is reported and skipped.
    pub async fn run_sweep_at(&self, now: Ms) -> SweepReport {
        let started = std::time::Instant::now();
        let mut report = SweepReport::default();
        let mut penalized = BTreeSet::new();

        self.sweep_reservations(now, &mut report, &mut penalized).await;
        self.sweep_sessions(now, &mut report, &mut penalized).await;

        if self.config.auto_suspend_after_sweep {
            for owner_id in penalized {
                match self.apply_auto_suspension_at(owner_id, now).await {
                    Ok(Some(_)) => report.suspensions_applied += 1,
                    Ok(None) => {}
                    Err(e) => {
                        warn!("auto-suspension of {owner_id} failed: {e}");
                        report.failures.push(SweepFailure {
                            record_id: owner_id,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if !report.failures.is_empty() {
            metrics::counter!(SWEEP_FAILURES_TOTAL).increment(report.failures.len() as u64);
        }
        if report.penalties_issued > 0 || report.auto_closed > 0 || !report.failures.is_empty() {
            info!(
                "sweep: {} reservations, {} sessions scanned; {} auto-closed, {} penalties, {} failures",
                report.reservations_scanned,
                report.sessions_scanned,
                report.auto_closed,
                report.penalties_issued,
                report.failures.len()
            );
        }
        report
    }

    async fn sweep_reservations(
        &self,
        now: Ms,
        report: &mut SweepReport,
        penalized: &mut BTreeSet<Ulid>,
    ) {
        // Strictly after start + grace; a sweep at exactly that instant leaves it alone.
        let cutoff = now.saturating_sub(self.config.no_show_grace_ms);
        let candidates: Vec<Ulid> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .take_while(|r| r.start < cutoff)
                .filter(|r| !r.penalty_processed)
                .map(|r| r.id)
                .collect()
        };

        for id in candidates {
            report.reservations_scanned += 1;
            let mut slots = self.slots.write().await;
            let Some(r) = slots.get(&id).filter(|r| !r.penalty_processed).cloned() else {
                debug!("reservation {id} already scored or gone");
                continue;
            };
            let issued = (!r.attended)
                .then(|| penalty(r.owner_id, PenaltyReason::NoShow, now, Some(r.id), None));
            let event = Event::ReservationScored {
                id,
                penalty: issued.clone(),
            };
            match self.persist_slots(&mut slots, &event).await {
                Ok(()) => {
                    if let Some(p) = issued {
                        report.penalties_issued += 1;
                        penalized.insert(p.owner_id);
                        count_penalty(p.reason);
                        info!("no-show penalty for {} on reservation {id}", p.owner_id);
                    }
                }
                Err(e) => record_failure(report, id, e),
            }
        }
    }

    async fn sweep_sessions(
        &self,
        now: Ms,
        report: &mut SweepReport,
        penalized: &mut BTreeSet<Ulid>,
    ) {
        let owners: Vec<(Ulid, SharedAttendance)> = self
            .attendance
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (owner_id, shared) in owners {
            let mut att = shared.write().await;
            let pending: Vec<AttendanceSession> = att
                .sessions()
                .iter()
                .filter(|s| !s.penalty_processed && s.check_in < now)
                .cloned()
                .collect();

            for session in pending {
                report.sessions_scanned += 1;
                let Some((auto_closed_at, reason)) =
                    score_session(&session, self.config.max_session_ms, now)
                else {
                    continue;
                };
                let issued = reason.map(|reason| penalty(owner_id, reason, now, None, Some(session.id)));
                let event = Event::SessionScored {
                    id: session.id,
                    owner_id,
                    auto_closed_at,
                    penalty: issued.clone(),
                };
                match self.persist_attendance(&mut att, &event).await {
                    Ok(()) => {
                        if auto_closed_at.is_some() {
                            report.auto_closed += 1;
                            info!("auto-closed session {} for {owner_id}", session.id);
                        }
                        if let Some(p) = issued {
                            report.penalties_issued += 1;
                            penalized.insert(owner_id);
                            count_penalty(p.reason);
                            info!("{} penalty for {owner_id} on session {}", p.reason, session.id);
                        }
                    }
                    Err(e) => record_failure(report, session.id, e),
                }
            }
        }
    }

    /// Points issued to an owner in `[now - penalty_window, now]`.
    pub fn window_points(&self, owner_id: Ulid, now: Ms) -> u32 {
        let from = now - self.config.penalty_window_ms;
        self.ledger.get(&owner_id).map_or(0, |records| {
            let lo = records.partition_point(|p| p.issued_at < from);
            let hi = records.partition_point(|p| p.issued_at <= now);
            records[lo..hi.max(lo)].iter().map(|p| p.points).sum()
        })
    }

    /// Every penalty an owner has received.
    pub fn owner_demerits(&self, owner_id: Ulid) -> DemeritSummary {
        let records: Vec<PenaltyRecord> = self
            .ledger
            .get(&owner_id)
            .map(|r| r.iter().rev().cloned().collect())
            .unwrap_or_default();
        let mut summary = DemeritSummary {
            owner_id,
            total_points: 0,
            points_by_reason: Default::default(),
            records: Vec::new(),
        };
        for p in &records {
            summary.total_points += p.points;
            *summary.points_by_reason.entry(p.reason).or_default() += p.points;
        }
        summary.records = records;
        summary
    }

    /// Facility-wide totals across the whole ledger.
    pub fn penalty_stats(&self) -> PenaltyStats {
        let mut stats = PenaltyStats::default();
        for entry in self.ledger.iter() {
            for p in entry.value() {
                stats.total_records += 1;
                stats.total_points += p.points;
                let by_reason = stats.by_reason.entry(p.reason).or_default();
                by_reason.count += 1;
                by_reason.points += p.points;
                let by_owner = stats.by_owner.entry(p.owner_id).or_default();
                by_owner.count += 1;
                by_owner.points += p.points;
            }
        }
        stats
    }
}

fn record_failure(report: &mut SweepReport, record_id: Ulid, e: EngineError) {
    warn!("sweep failed on {record_id}: {e}");
    report.failures.push(SweepFailure {
        record_id,
        error: e.to_string(),
    });
}
