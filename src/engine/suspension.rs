use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::format_instant;
use crate::limits::{MAX_MANUAL_SUSPENSION_DAYS, MAX_REASON_LEN};
use crate::model::*;
use crate::observability::SUSPENSIONS_APPLIED_TOTAL;

use super::{Engine, EngineError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspensionTier {
    /// Suspends when window points are strictly above this.
    pub min_points_exclusive: u32,
    pub days: u32,
}

/// Highest first; the first tier that matches wins.
pub const SUSPENSION_TIERS: [SuspensionTier; 3] = [
    SuspensionTier {
        min_points_exclusive: 15,
        days: 30,
    },
    SuspensionTier {
        min_points_exclusive: 10,
        days: 14,
    },
    SuspensionTier {
        min_points_exclusive: 5,
        days: 7,
    },
];

pub fn tier_for(points: u32) -> Option<SuspensionTier> {
    SUSPENSION_TIERS
        .iter()
        .find(|t| points > t.min_points_exclusive)
        .copied()
}

fn validate_manual(days: u32, reason: &str) -> Result<(), ValidationError> {
    if days == 0 || days > MAX_MANUAL_SUSPENSION_DAYS {
        return Err(ValidationError::SuspensionLength {
            days,
            max: MAX_MANUAL_SUSPENSION_DAYS,
        });
    }
    if reason.trim().is_empty() || reason.len() > MAX_REASON_LEN {
        return Err(ValidationError::SuspensionReason {
            max: MAX_REASON_LEN,
        });
    }
    Ok(())
}

impl Engine {
    /// Tier decision from the points inside the trailing penalty window.
    /// Pure: nothing is applied.
    pub fn evaluate(&self, owner_id: Ulid, now: Ms) -> SuspensionDecision {
        let points = self.window_points(owner_id, now);
        let window_days = self.config.penalty_window_ms / DAY_MS;
        match tier_for(points) {
            Some(tier) => SuspensionDecision {
                owner_id,
                points,
                suspend_days: Some(tier.days),
                until: Some(now + tier.days as Ms * DAY_MS),
                reason: Some(format!(
                    "{points} demerit points in the last {window_days} days"
                )),
            },
            None => SuspensionDecision {
                owner_id,
                points,
                suspend_days: None,
                until: None,
                reason: None,
            },
        }
    }

    /// Evaluate and, if a tier matches, apply it.
    pub async fn apply_auto_suspension(
        &self,
        owner_id: Ulid,
    ) -> Result<Option<SuspensionState>, EngineError> {
        self.apply_auto_suspension_at(owner_id, self.clock.now()).await
    }

    /// Never shortens or replaces an active manual suspension, and never
    /// rewrites an automatic one that already runs at least as long.
    pub(super) async fn apply_auto_suspension_at(
        &self,
        owner_id: Ulid,
        now: Ms,
    ) -> Result<Option<SuspensionState>, EngineError> {
        let _writes = self.suspension_writes.lock().await;
        let decision = self.evaluate(owner_id, now);
        let (Some(until), Some(reason)) = (decision.until, decision.reason) else {
            return Ok(None);
        };

        if let Some(current) = self.suspensions.get(&owner_id).map(|s| s.value().clone())
            && current.is_active(now)
        {
            let covered = current.active_until.is_some_and(|t| t >= until);
            if current.source == SuspensionSource::Manual || covered {
                debug!("{owner_id} already suspended until {:?}", current.active_until);
                return Ok(None);
            }
        }

        let state = self
            .persist_suspension(owner_id, until, reason, SuspensionSource::Automatic)
            .await?;
        info!(
            "auto-suspended {owner_id} until {} ({} points)",
            format_instant(until),
            decision.points
        );
        Ok(Some(state))
    }

    /// Manual override: replaces whatever is recorded.
    pub async fn apply_suspension(
        &self,
        owner_id: Ulid,
        days: u32,
        reason: &str,
    ) -> Result<SuspensionState, EngineError> {
        validate_manual(days, reason)?;
        let _writes = self.suspension_writes.lock().await;
        let until = self.clock.now() + days as Ms * DAY_MS;
        let state = self
            .persist_suspension(owner_id, until, reason.trim().to_string(), SuspensionSource::Manual)
            .await?;
        info!("suspended {owner_id} for {days} days: {reason}");
        Ok(state)
    }

    /// Clears the owner's suspension. Returns what was removed.
    pub async fn remove_suspension(
        &self,
        owner_id: Ulid,
    ) -> Result<Option<SuspensionState>, EngineError> {
        let _writes = self.suspension_writes.lock().await;
        let Some(current) = self.suspensions.get(&owner_id).map(|s| s.value().clone()) else {
            return Ok(None);
        };
        let event = Event::SuspensionRemoved { owner_id };
        self.wal_append(&event).await?;
        self.apply_to_indexes(&event);
        info!("lifted suspension of {owner_id}");
        Ok(Some(current))
    }

    async fn persist_suspension(
        &self,
        owner_id: Ulid,
        active_until: Ms,
        reason: String,
        source: SuspensionSource,
    ) -> Result<SuspensionState, EngineError> {
        let event = Event::SuspensionApplied {
            owner_id,
            active_until,
            reason: reason.clone(),
            source,
        };
        self.wal_append(&event).await?;
        self.apply_to_indexes(&event);
        metrics::counter!(SUSPENSIONS_APPLIED_TOTAL, "source" => source.as_str()).increment(1);
        Ok(SuspensionState {
            owner_id,
            active_until: Some(active_until),
            reason: Some(reason),
            source,
        })
    }

    pub fn is_suspended(&self, owner_id: Ulid, now: Ms) -> bool {
        self.suspensions
            .get(&owner_id)
            .is_some_and(|s| s.is_active(now))
    }

    pub fn suspension_status(&self, owner_id: Ulid) -> SuspensionStatus {
        let now = self.clock.now();
        let state = self.suspensions.get(&owner_id).map(|s| s.value().clone());
        let remaining_ms = state
            .as_ref()
            .filter(|s| s.is_active(now))
            .and_then(|s| s.active_until)
            .map_or(0, |until| until - now);
        SuspensionStatus {
            suspended: remaining_ms > 0,
            state,
            remaining_ms,
        }
    }

    /// Every recorded suspension, lapsed ones included, by owner id.
    pub fn list_suspensions(&self) -> Vec<SuspensionState> {
        let mut all: Vec<SuspensionState> =
            self.suspensions.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.owner_id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_use_exclusive_lower_bounds() {
        assert_eq!(tier_for(5), None);
        assert_eq!(tier_for(6).map(|t| t.days), Some(7));
        assert_eq!(tier_for(10).map(|t| t.days), Some(7));
        assert_eq!(tier_for(11).map(|t| t.days), Some(14));
        assert_eq!(tier_for(15).map(|t| t.days), Some(14));
        assert_eq!(tier_for(16).map(|t| t.days), Some(30));
        assert_eq!(tier_for(0), None);
    }

    #[test]
    fn manual_limits() {
        assert!(validate_manual(7, "repeated no-shows").is_ok());
        assert_eq!(
            validate_manual(0, "x"),
            Err(ValidationError::SuspensionLength { days: 0, max: 365 })
        );
        assert!(validate_manual(366, "x").is_err());
        assert_eq!(
            validate_manual(7, "   "),
            Err(ValidationError::SuspensionReason { max: 512 })
        );
        assert!(validate_manual(7, &"x".repeat(513)).is_err());
    }
}
