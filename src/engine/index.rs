use std::collections::{BTreeSet, HashMap};

use ulid::Ulid;

use crate::model::*;

/// All live reservations for the floor, answering overlap questions.
///
/// Reservations are kept sorted by `start`; a per-owner `(start, id)` index
/// serves the self-overlap and daily-limit checks without a full scan.
#[derive(Debug, Default, Clone)]
pub struct SlotIndex {
    reservations: Vec<Reservation>,
    starts: HashMap<Ulid, Ms>,
    by_owner: HashMap<Ulid, BTreeSet<(Ms, Ulid)>>,
    /// Longest duration ever indexed. Bounds how far back an overlap can start.
    longest: Ms,
}

impl SlotIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    /// Insert maintaining sort order by start. Replaces any reservation with the same id.
    pub fn insert(&mut self, reservation: Reservation) {
        self.remove(reservation.id);
        self.longest = self.longest.max(reservation.end() - reservation.start);
        let pos = self
            .reservations
            .partition_point(|r| r.start <= reservation.start);
        self.starts.insert(reservation.id, reservation.start);
        self.by_owner
            .entry(reservation.owner_id)
            .or_default()
            .insert((reservation.start, reservation.id));
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.position(&id)?;
        let removed = self.reservations.remove(pos);
        self.starts.remove(&id);
        if let Some(keys) = self.by_owner.get_mut(&removed.owner_id) {
            keys.remove(&(removed.start, id));
            if keys.is_empty() {
                self.by_owner.remove(&removed.owner_id);
            }
        }
        Some(removed)
    }

    fn position(&self, id: &Ulid) -> Option<usize> {
        let start = *self.starts.get(id)?;
        let from = self.reservations.partition_point(|r| r.start < start);
        self.reservations[from..]
            .iter()
            .take_while(|r| r.start == start)
            .position(|r| r.id == *id)
            .map(|offset| from + offset)
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.position(id).map(|pos| &self.reservations[pos])
    }

    /// Flag updates only. Changing `start` through this breaks the sort order;
    /// reschedule with `insert` instead.
    pub(crate) fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.position(id).map(move |pos| &mut self.reservations[pos])
    }

    /// Everything, soonest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Reservation> {
        self.reservations.iter()
    }

    /// Reservations whose `[start, end)` intersects the query.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Nothing starting at or after query.end can overlap, nor anything
        // that ends (at the longest) before query.start.
        let query = *query;
        let longest = self.longest;
        let left = self
            .reservations
            .partition_point(|r| r.start + longest <= query.start);
        let right = self
            .reservations
            .partition_point(|r| r.start < query.end);
        let window = if left < right {
            &self.reservations[left..right]
        } else {
            &self.reservations[..0]
        };
        window.iter().filter(move |r| r.span().overlaps(&query))
    }

    /// Reservations starting inside `window`.
    pub fn starting_within(&self, window: &Span) -> &[Reservation] {
        let left = self.reservations.partition_point(|r| r.start < window.start);
        let right = self.reservations.partition_point(|r| r.start < window.end);
        if left < right {
            &self.reservations[left..right]
        } else {
            &self.reservations[..0]
        }
    }

    pub fn overlap_count(&self, query: &Span, exclude_owner: Option<Ulid>) -> usize {
        self.overlapping(query)
            .filter(|r| Some(r.owner_id) != exclude_owner)
            .count()
    }

    fn owner_keys(&self, owner: &Ulid, from: Ms, to: Ms) -> impl Iterator<Item = &Ulid> {
        self.by_owner
            .get(owner)
            .into_iter()
            .flat_map(move |keys| {
                // Ulid::nil() sorts first, so these bounds are [from, to) on start.
                keys.range((from, Ulid::nil())..(to, Ulid::nil()))
                    .map(|(_, id)| id)
            })
    }

    pub fn owner_overlaps(&self, owner: Ulid, query: &Span) -> Vec<Reservation> {
        if query.end <= query.start {
            return Vec::new();
        }
        self.owner_keys(&owner, query.start.saturating_sub(self.longest), query.end)
            .filter_map(|id| self.get(id))
            .filter(|r| r.span().overlaps(query))
            .cloned()
            .collect()
    }

    /// Owner reservations whose start falls in `day` (any window, normally a UTC day).
    pub fn owner_daily_count(&self, owner: Ulid, day: &Span) -> usize {
        self.owner_keys(&owner, day.start, day.end).count()
    }

    /// One owner's reservations, soonest first.
    pub fn owner_reservations(&self, owner: Ulid) -> Vec<&Reservation> {
        self.owner_keys(&owner, Ms::MIN, Ms::MAX)
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Portions of `window` where fewer than `capacity` reservations overlap.
    pub fn free_spans(&self, window: &Span, capacity: u32) -> Vec<Span> {
        let mut allocs: Vec<Span> = self.overlapping(window).map(|r| r.span()).collect();
        allocs.sort_by_key(|s| s.start);
        let saturated = compute_saturated_spans(&allocs, capacity);
        subtract_intervals(&[*window], &saturated)
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// Sweep line: time ranges where the overlap count is at least `capacity`.
/// Input sorted by start; output sorted and merged.
pub fn compute_saturated_spans(allocs: &[Span], capacity: u32) -> Vec<Span> {
    if allocs.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        return merge_overlapping(allocs);
    }

    let mut events: Vec<(Ms, i32)> = Vec::with_capacity(allocs.len() * 2);
    for a in allocs {
        events.push((a.start, 1));
        events.push((a.end, -1));
    }
    // Ends before starts at the same instant: half-open spans that touch don't stack.
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut count: i64 = 0;
    let mut saturated_start: Option<Ms> = None;

    for (time, delta) in &events {
        count += *delta as i64;
        if count >= capacity as i64 && saturated_start.is_none() {
            saturated_start = Some(*time);
        } else if count < capacity as i64
            && let Some(start) = saturated_start.take()
            && *time > start
        {
            result.push(Span::new(start, *time));
        }
    }

    merge_overlapping(&result)
}
