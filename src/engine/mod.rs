mod admission;
mod attendance;
mod booking;
mod demerit;
mod error;
mod index;
mod queries;
mod suspension;

pub use attendance::OwnerAttendance;
pub use error::{EngineError, Rejection, ValidationError};
pub use index::{SlotIndex, compute_saturated_spans, merge_overlapping, subtract_intervals};
pub use suspension::{SUSPENSION_TIERS, SuspensionTier, tier_for};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::model::*;
use crate::wal::Wal;

pub type SharedAttendance = Arc<RwLock<OwnerAttendance>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends: take the first append, drain whatever
/// else is already queued, then one fsync for the lot.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Everything queued before a compaction must be on disk first.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after a failed append so stray buffered bytes don't leak
    // into the next batch; every caller in this batch is told it failed.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking, attendance and demerit core for one gym floor.
///
/// Lock order, always: `slots` → one or more owner attendance locks (in id
/// order) → `suspension_writes`. The ledger and suspension maps are only
/// touched synchronously, never across an await.
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) clock: Arc<dyn Clock>,
    /// Every live reservation. Its write lock serializes all admission decisions.
    pub(super) slots: RwLock<SlotIndex>,
    /// Owner → attendance history. One lock per owner serializes check-in/out.
    pub(super) attendance: DashMap<Ulid, SharedAttendance>,
    /// Reverse lookup: session id → owner id.
    pub(super) session_owner: DashMap<Ulid, Ulid>,
    /// Owner → penalty records ordered by `issued_at`.
    pub(super) ledger: DashMap<Ulid, Vec<PenaltyRecord>>,
    pub(super) suspensions: DashMap<Ulid, SuspensionState>,
    pub(super) suspension_writes: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Appends left to fail before the writer is consulted again.
    #[cfg(test)]
    fail_appends: std::sync::atomic::AtomicUsize,
}

fn apply_to_slots(slots: &mut SlotIndex, event: &Event) {
    match event {
        Event::ReservationAdmitted {
            id,
            owner_id,
            start,
            duration_hours,
        } => slots.insert(Reservation::new(*id, *owner_id, *start, *duration_hours)),
        Event::ReservationModified {
            id,
            start,
            duration_hours,
        } => {
            if let Some(mut r) = slots.remove(*id) {
                r.start = *start;
                r.duration_hours = *duration_hours;
                slots.insert(r);
            }
        }
        Event::ReservationCancelled { id } => {
            slots.remove(*id);
        }
        Event::CheckedIn { reservation_id, .. } => {
            if let Some(r) = slots.get_mut(reservation_id) {
                r.attended = true;
            }
        }
        Event::ReservationScored { id, .. } => {
            if let Some(r) = slots.get_mut(id) {
                r.penalty_processed = true;
            }
        }
        Event::ReservationRestored(r) => slots.insert(r.clone()),
        _ => {}
    }
}

fn apply_to_attendance(att: &mut OwnerAttendance, event: &Event) {
    match event {
        Event::CheckedIn {
            session_id,
            owner_id,
            at,
            ..
        } => att.begin(AttendanceSession {
            id: *session_id,
            owner_id: *owner_id,
            check_in: *at,
            check_out: None,
            penalty_processed: false,
        }),
        Event::CheckedOut { session_id, at, .. } => att.close(session_id, *at),
        Event::SessionScored {
            id, auto_closed_at, ..
        } => {
            if let Some(at) = auto_closed_at {
                att.close(id, *at);
            }
            if let Some(s) = att.get_mut(id) {
                s.penalty_processed = true;
            }
        }
        Event::SessionRestored(s) => att.restore(s.clone()),
        _ => {}
    }
}

/// Owner whose attendance an event touches, if any.
fn attendance_owner(event: &Event) -> Option<Ulid> {
    match event {
        Event::CheckedIn { owner_id, .. }
        | Event::CheckedOut { owner_id, .. }
        | Event::SessionScored { owner_id, .. } => Some(*owner_id),
        Event::SessionRestored(s) => Some(s.owner_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(
                "discarding torn tail of {} after {} bytes",
                wal_path.display(),
                replay.valid_len
            );
            Wal::truncate_to(&wal_path, replay.valid_len)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            config,
            clock,
            slots: RwLock::new(SlotIndex::new()),
            attendance: DashMap::new(),
            session_owner: DashMap::new(),
            ledger: DashMap::new(),
            suspensions: DashMap::new(),
            suspension_writes: Mutex::new(()),
            wal_tx,
            #[cfg(test)]
            fail_appends: std::sync::atomic::AtomicUsize::new(0),
        };

        // Sole owner of every lock here, so try_write always succeeds. Never
        // block: this may run inside an async context.
        {
            let mut slots = engine
                .slots
                .try_write()
                .map_err(|_| io::Error::other("replay: slot index contended"))?;
            for event in &replay.events {
                apply_to_slots(&mut slots, event);
                if let Some(owner) = attendance_owner(event) {
                    let shared = engine.attendance_for(owner);
                    let mut att = shared
                        .try_write()
                        .map_err(|_| io::Error::other("replay: attendance contended"))?;
                    apply_to_attendance(&mut att, event);
                }
                engine.apply_to_indexes(event);
            }
        }

        info!(
            "replayed {} events from {}",
            replay.events.len(),
            wal_path.display()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Write event to the WAL via the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .fail_appends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::Storage("injected write failure".into()));
            }
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Make the next `n` WAL appends fail with a storage error.
    #[cfg(test)]
    pub(super) fn fail_next_appends(&self, n: usize) {
        self.fail_appends
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Existing or fresh attendance state for an owner.
    pub(super) fn attendance_for(&self, owner: Ulid) -> SharedAttendance {
        self.attendance.entry(owner).or_default().value().clone()
    }

    /// Ledger, session lookup and suspension side of an event. Synchronous;
    /// the caller holds whichever lock guards the record that produced it.
    pub(super) fn apply_to_indexes(&self, event: &Event) {
        match event {
            Event::CheckedIn {
                session_id,
                owner_id,
                ..
            } => {
                self.session_owner.insert(*session_id, *owner_id);
            }
            Event::SessionRestored(s) => {
                self.session_owner.insert(s.id, s.owner_id);
            }
            Event::ReservationScored {
                penalty: Some(p), ..
            }
            | Event::SessionScored {
                penalty: Some(p), ..
            }
            | Event::PenaltyRestored(p) => self.record_penalty(p.clone()),
            Event::SuspensionApplied {
                owner_id,
                active_until,
                reason,
                source,
            } => {
                self.suspensions.insert(
                    *owner_id,
                    SuspensionState {
                        owner_id: *owner_id,
                        active_until: Some(*active_until),
                        reason: Some(reason.clone()),
                        source: *source,
                    },
                );
            }
            Event::SuspensionRemoved { owner_id } => {
                self.suspensions.remove(owner_id);
            }
            _ => {}
        }
    }

    fn record_penalty(&self, penalty: PenaltyRecord) {
        let mut records = self.ledger.entry(penalty.owner_id).or_default();
        let pos = records.partition_point(|p| p.issued_at <= penalty.issued_at);
        records.insert(pos, penalty);
    }

    /// WAL-append, then apply to the slot index and side indexes.
    pub(super) async fn persist_slots(
        &self,
        slots: &mut SlotIndex,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slots(slots, event);
        self.apply_to_indexes(event);
        Ok(())
    }

    /// WAL-append, then apply to one owner's attendance and side indexes.
    pub(super) async fn persist_attendance(
        &self,
        att: &mut OwnerAttendance,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_attendance(att, event);
        self.apply_to_indexes(event);
        Ok(())
    }

    /// Check-in touches both sides; caller holds both locks.
    pub(super) async fn persist_check_in(
        &self,
        slots: &mut SlotIndex,
        att: &mut OwnerAttendance,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slots(slots, event);
        apply_to_attendance(att, event);
        self.apply_to_indexes(event);
        Ok(())
    }

    /// Rewrite the WAL as a snapshot of current state.
    ///
    /// Holds every write lock in the documented order while snapshotting and
    /// swapping, so no mutation can slip between the two.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let slots = self.slots.write().await;

        let mut owners: Vec<Ulid> = self.attendance.iter().map(|e| *e.key()).collect();
        owners.sort();
        let mut guards = Vec::with_capacity(owners.len());
        for owner in &owners {
            guards.push(self.attendance_for(*owner).write_owned().await);
        }
        let _suspensions = self.suspension_writes.lock().await;

        let mut events: Vec<Event> = slots
            .iter()
            .map(|r| Event::ReservationRestored(r.clone()))
            .collect();
        for guard in &guards {
            events.extend(
                guard
                    .sessions()
                    .iter()
                    .map(|s| Event::SessionRestored(s.clone())),
            );
        }
        for entry in self.ledger.iter() {
            events.extend(entry.value().iter().map(|p| Event::PenaltyRestored(p.clone())));
        }
        for entry in self.suspensions.iter() {
            let s = entry.value();
            if let Some(active_until) = s.active_until {
                events.push(Event::SuspensionApplied {
                    owner_id: s.owner_id,
                    active_until,
                    reason: s.reason.clone().unwrap_or_default(),
                    source: s.source,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!("compacted WAL to {count} snapshot events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
