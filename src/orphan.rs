//! Periodic janitor for vehicles whose owners have stopped playing.

use crate::config::{OrphanAction, OrphanPolicy};
use crate::core::{EntityId, EntityRecord, OwnerId, PersistError, Result};
use crate::worker::RunGuard;
use crate::registry::EntityRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{Instrument, Level, event, info_span};

const SECONDS_PER_DAY: i64 = 86_400;

/// Last time an owner was seen online.
#[async_trait]
pub trait OwnerActivity: Send + Sync {
    /// `None` when the owner is unknown to the identity backend.
    async fn last_active_at(&self, owner_id: &OwnerId) -> Result<Option<DateTime<Utc>>>;
}

/// Mutation against the ownership store that backs impounding.
#[async_trait]
pub trait OwnedEntityMutator: Send + Sync {
    /// Marks the owned vehicle as impounded at `lot` with `fee` due.
    /// Returns the number of rows affected.
    async fn mark_impounded(&self, id: &EntityId, lot: &str, fee: u64) -> Result<u64>;
}

/// Fee for a vehicle abandoned since `saved_at`: whole days times the daily
/// rate, clamped to `max_fee`.
pub fn impound_fee(saved_at: DateTime<Utc>, now: DateTime<Utc>, fee_per_day: u64, max_fee: u64) -> u64 {
    let days = (now - saved_at).num_seconds().max(0) / SECONDS_PER_DAY;
    (days as u64).saturating_mul(fee_per_day).min(max_fee)
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Records that met both staleness conditions.
    pub candidates: usize,
    pub impounded: usize,
    pub deleted: usize,
    /// Candidates left tracked because impounding failed; retried next sweep.
    pub retained: usize,
    /// Candidates that disappeared or were re-saved while the sweep ran.
    pub vanished: usize,
    /// Records skipped because their owner's activity could not be read.
    pub skipped: usize,
}

pub struct OrphanSweeper {
    registry: Arc<EntityRegistry>,
    activity: Arc<dyn OwnerActivity>,
    mutator: Arc<dyn OwnedEntityMutator>,
    policy: OrphanPolicy,
    running: AtomicBool,
    impounded_total: AtomicU64,
    deleted_total: AtomicU64,
}

impl OrphanSweeper {
    pub fn new(
        registry: Arc<EntityRegistry>,
        activity: Arc<dyn OwnerActivity>,
        mutator: Arc<dyn OwnedEntityMutator>,
        policy: OrphanPolicy,
    ) -> Self {
        Self {
            registry,
            activity,
            mutator,
            policy,
            running: AtomicBool::new(false),
            impounded_total: AtomicU64::new(0),
            deleted_total: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &OrphanPolicy {
        &self.policy
    }

    pub fn impounded_total(&self) -> u64 {
        self.impounded_total.load(Ordering::Relaxed)
    }

    pub fn deleted_total(&self) -> u64 {
        self.deleted_total.load(Ordering::Relaxed)
    }

    pub async fn sweep(&self) -> Result<OrphanReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Runs one sweep as of `now`. Progress is per record: a crash midway
    /// leaves the remaining candidates for the next run.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<OrphanReport> {
        let _running = RunGuard::acquire(&self.running, "orphan sweep")?;

        let span = info_span!("orphan.sweep", action = ?self.policy.action);
        self.run_sweep(now).instrument(span).await
    }

    async fn run_sweep(&self, now: DateTime<Utc>) -> Result<OrphanReport> {
        let threshold = self.policy.threshold();
        let mut report = OrphanReport::default();

        let stale = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|record| !record.being_used && now - record.saved_at > threshold)
            .collect::<Vec<_>>();
        if stale.is_empty() {
            return Ok(report);
        }

        let owners = stale
            .iter()
            .map(|record| record.owner_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let lookups = join_all(owners.iter().map(|owner| self.activity.last_active_at(owner))).await;
        let activity = owners
            .into_iter()
            .zip(lookups)
            .collect::<HashMap<OwnerId, Result<Option<DateTime<Utc>>>>>();

        let mut candidates = Vec::new();
        for record in stale {
            match activity.get(&record.owner_id) {
                Some(Ok(Some(last_active))) if now - *last_active <= threshold => {}
                Some(Ok(_)) => candidates.push(record),
                Some(Err(err)) => {
                    event!(
                        Level::WARN,
                        owner_id = %record.owner_id,
                        error = %err,
                        "owner activity lookup failed, skipping"
                    );
                    report.skipped += 1;
                }
                None => report.skipped += 1,
            }
        }
        report.candidates = candidates.len();

        for record in candidates {
            match self.policy.action {
                OrphanAction::Delete => {
                    if self.registry.remove_if_saved_at(&record.id, record.saved_at).await {
                        report.deleted += 1;
                        self.deleted_total.fetch_add(1, Ordering::Relaxed);
                        event!(Level::INFO, entity_id = %record.id, "orphan deleted");
                    } else {
                        report.vanished += 1;
                    }
                }
                OrphanAction::Impound => match self.impound(&record, now).await {
                    Ok(true) => {
                        report.impounded += 1;
                        self.impounded_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => report.vanished += 1,
                    Err(err) => {
                        event!(
                            Level::WARN,
                            entity_id = %record.id,
                            error = %err,
                            "impound failed, keeping record for next sweep"
                        );
                        report.retained += 1;
                    }
                },
            }
        }

        event!(
            Level::INFO,
            candidates = report.candidates,
            impounded = report.impounded,
            deleted = report.deleted,
            retained = report.retained,
            vanished = report.vanished,
            "orphan sweep finished"
        );
        Ok(report)
    }

    /// Marks the vehicle impounded, then drops it from the registry. The
    /// record is only removed after the ownership store confirms the change.
    /// `Ok(false)` means the record is gone or was saved again since the
    /// sweep snapshot.
    async fn impound(&self, record: &EntityRecord, now: DateTime<Utc>) -> Result<bool> {
        match self.registry.get(&record.id).await {
            Some(current) if current.saved_at == record.saved_at && !current.being_used => {}
            _ => return Ok(false),
        }

        let fee = impound_fee(record.saved_at, now, self.policy.fee_per_day, self.policy.max_fee);
        let rows = self
            .mutator
            .mark_impounded(&record.id, &self.policy.impound_lot, fee)
            .await
            .map_err(|err| PersistError::ExternalMutation(err.to_string()))?;
        if rows == 0 {
            return Err(PersistError::ExternalMutation(format!(
                "no owned vehicle row for {}",
                record.id
            )));
        }

        // A save racing the mutation keeps the fresh record tracked.
        let removed = self
            .registry
            .remove_if_saved_at(&record.id, record.saved_at)
            .await;
        event!(
            Level::INFO,
            entity_id = %record.id,
            owner_id = %record.owner_id,
            fee,
            lot = %self.policy.impound_lot,
            removed,
            "orphan impounded"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_fee_counts_whole_days() {
        let saved = now() - Duration::days(8);
        assert_eq!(impound_fee(saved, now(), 100, 1_500), 800);

        let saved = now() - Duration::days(8) - Duration::hours(23);
        assert_eq!(impound_fee(saved, now(), 100, 1_500), 800);
    }

    #[test]
    fn test_fee_clamps_to_max() {
        let saved = now() - Duration::days(20);
        assert_eq!(impound_fee(saved, now(), 100, 1_500), 1_500);
    }

    #[test]
    fn test_fee_never_negative() {
        let saved = now() + Duration::days(1);
        assert_eq!(impound_fee(saved, now(), 100, 1_500), 0);
    }
}
