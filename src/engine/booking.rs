use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::format_instant;
use crate::model::*;
use crate::observability::{ADMISSIONS_TOTAL, rejection_label};

use super::admission::{check_admission, check_unlocked, validate_duration, validate_instant};
use super::{Engine, EngineError, Rejection, ValidationError};

fn count_admission(outcome: &'static str) {
    metrics::counter!(ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
}

fn reject(rejection: Rejection) -> EngineError {
    count_admission(rejection_label(&rejection));
    rejection.into()
}

impl Engine {
    /// Admit a new reservation if the owner and the floor both have room.
    pub async fn admit(
        &self,
        owner_id: Ulid,
        start: Ms,
        duration_hours: u32,
    ) -> Result<Reservation, EngineError> {
        validate_instant(start)?;
        validate_duration(&self.config, duration_hours)?;
        let reservation = Reservation::new(Ulid::new(), owner_id, start, duration_hours);
        let span = reservation.span();

        let mut slots = self.slots.write().await;
        if let Err(rejection) = check_admission(&slots, &self.config, owner_id, &span) {
            debug!("admission for {owner_id} at {} rejected: {rejection}", format_instant(start));
            return Err(reject(rejection));
        }

        let event = Event::ReservationAdmitted {
            id: reservation.id,
            owner_id,
            start,
            duration_hours,
        };
        self.persist_slots(&mut slots, &event).await?;
        count_admission("admitted");
        info!(
            "admitted reservation {} for {owner_id}: {} for {duration_hours}h",
            reservation.id,
            format_instant(start)
        );
        Ok(reservation)
    }

    /// Move and/or resize an owner's reservation. The new interval is checked
    /// as a fresh admission with the old one set aside.
    pub async fn modify(
        &self,
        reservation_id: Ulid,
        owner_id: Ulid,
        new_start: Option<Ms>,
        new_duration_hours: Option<u32>,
    ) -> Result<Reservation, EngineError> {
        if new_start.is_none() && new_duration_hours.is_none() {
            return Err(ValidationError::EmptyModification.into());
        }
        if let Some(start) = new_start {
            validate_instant(start)?;
        }
        if let Some(hours) = new_duration_hours {
            validate_duration(&self.config, hours)?;
        }

        let now = self.clock.now();
        let mut slots = self.slots.write().await;
        let current = owned_reservation(slots.get(&reservation_id), reservation_id, owner_id)?;
        check_unlocked(&self.config, &current, now)?;

        let updated = Reservation {
            start: new_start.unwrap_or(current.start),
            duration_hours: new_duration_hours.unwrap_or(current.duration_hours),
            ..current.clone()
        };

        // Set the current interval aside so it doesn't count against itself.
        slots.remove(reservation_id);
        let verdict = check_admission(&slots, &self.config, owner_id, &updated.span());
        slots.insert(current);
        if let Err(rejection) = verdict {
            debug!("modification of {reservation_id} rejected: {rejection}");
            return Err(reject(rejection));
        }

        let event = Event::ReservationModified {
            id: reservation_id,
            start: updated.start,
            duration_hours: updated.duration_hours,
        };
        self.persist_slots(&mut slots, &event).await?;
        count_admission("modified");
        info!(
            "modified reservation {reservation_id}: {} for {}h",
            format_instant(updated.start),
            updated.duration_hours
        );
        Ok(updated)
    }

    /// Cancel before the lock-out window. Returns the removed reservation.
    pub async fn cancel(
        &self,
        reservation_id: Ulid,
        owner_id: Ulid,
    ) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let mut slots = self.slots.write().await;
        let current = owned_reservation(slots.get(&reservation_id), reservation_id, owner_id)?;
        check_unlocked(&self.config, &current, now)?;

        let event = Event::ReservationCancelled { id: reservation_id };
        self.persist_slots(&mut slots, &event).await?;
        info!("cancelled reservation {reservation_id} for {owner_id}");
        Ok(current)
    }
}

fn owned_reservation(
    found: Option<&Reservation>,
    reservation_id: Ulid,
    owner_id: Ulid,
) -> Result<Reservation, Rejection> {
    let reservation = found.ok_or(Rejection::NotFound(reservation_id))?;
    if reservation.owner_id != owner_id {
        return Err(Rejection::NotOwner(reservation_id));
    }
    Ok(reservation.clone())
}
