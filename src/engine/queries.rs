use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{WeekPolicy, date_window, week_window};
use crate::model::*;

use super::{Engine, EngineError, Rejection};

impl Engine {
    pub async fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let slots = self.slots.read().await;
        slots
            .get(&id)
            .cloned()
            .ok_or_else(|| Rejection::NotFound(id).into())
    }

    /// Soonest first.
    pub async fn all_reservations(&self) -> Vec<Reservation> {
        self.slots.read().await.iter().cloned().collect()
    }

    /// Reservations starting on a UTC calendar day, soonest first.
    pub async fn reservations_on(&self, date: NaiveDate) -> Vec<Reservation> {
        let window = date_window(date);
        self.slots.read().await.starting_within(&window).to_vec()
    }

    pub async fn reservations_for_week(&self, date: NaiveDate, policy: WeekPolicy) -> WeekView {
        let window = week_window(date, policy);
        let now = self.clock.now();
        let slots = self.slots.read().await;
        let (past, upcoming): (Vec<Reservation>, Vec<Reservation>) = slots
            .starting_within(&window)
            .iter()
            .cloned()
            .partition(|r| r.start < now);
        WeekView {
            window,
            past,
            upcoming,
        }
    }

    /// Newest first.
    pub async fn owner_history(&self, owner_id: Ulid) -> Vec<Reservation> {
        let slots = self.slots.read().await;
        slots
            .owner_reservations(owner_id)
            .into_iter()
            .rev()
            .cloned()
            .collect()
    }

    /// Starting now or later, soonest first.
    pub async fn upcoming_reservations(&self) -> Vec<Reservation> {
        let now = self.clock.now();
        let slots = self.slots.read().await;
        slots.iter().filter(|r| r.start >= now).cloned().collect()
    }

    /// Already started, newest first.
    pub async fn past_reservations(&self) -> Vec<Reservation> {
        let now = self.clock.now();
        let slots = self.slots.read().await;
        slots
            .iter()
            .rev()
            .filter(|r| r.start < now)
            .cloned()
            .collect()
    }

    /// Parts of a UTC day where the floor still has room.
    pub async fn free_slots(&self, date: NaiveDate) -> Vec<Span> {
        let window = date_window(date);
        self.slots
            .read()
            .await
            .free_spans(&window, self.config.max_concurrent_per_slot)
    }

    pub async fn overlap_count(&self, range: Span, exclude_owner: Option<Ulid>) -> usize {
        self.slots.read().await.overlap_count(&range, exclude_owner)
    }

    pub async fn owner_overlaps(&self, owner_id: Ulid, range: Span) -> Vec<Reservation> {
        self.slots.read().await.owner_overlaps(owner_id, &range)
    }

    pub async fn owner_daily_count(&self, owner_id: Ulid, date: NaiveDate) -> usize {
        self.slots
            .read()
            .await
            .owner_daily_count(owner_id, &date_window(date))
    }
}
