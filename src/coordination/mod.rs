//! Exclusion and lock claims that subsystems (garages, towing, mechanics,
//! rentals) consult before acting on a vehicle.
//!
//! Lock order across tables is fixed: exclusions, then locks, then the
//! registry. Every path that holds more than one of them acquires them in
//! that order.

pub mod claims;

pub use claims::ClaimTable;

use crate::core::{EntityId, EntityRecord, EntityStatus, ExclusionClaim, LockClaim, PersistError, Result};
use crate::registry::EntityRegistry;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

pub struct Coordinator {
    exclusions: Arc<ClaimTable<ExclusionClaim>>,
    locks: Arc<ClaimTable<LockClaim>>,
    registry: Arc<EntityRegistry>,
    lock_ttl: Duration,
    locks_expired_total: AtomicU64,
}

impl Coordinator {
    pub fn new(
        exclusions: Arc<ClaimTable<ExclusionClaim>>,
        locks: Arc<ClaimTable<LockClaim>>,
        registry: Arc<EntityRegistry>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            exclusions,
            locks,
            registry,
            lock_ttl,
            locks_expired_total: AtomicU64::new(0),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    // ------------------------------------------------------------------
    // Exclusions
    // ------------------------------------------------------------------

    /// Takes `id` out of persistence for good. Any tracked record is removed
    /// while the exclusion table is still held, so no save can slip in
    /// between the claim and the removal.
    ///
    /// Returns the record that was tracked, if any.
    pub async fn claim_exclusion(
        &self,
        id: &EntityId,
        claimant: &str,
        reason: &str,
    ) -> Result<Option<EntityRecord>> {
        if claimant.trim().is_empty() {
            return Err(PersistError::Validation("claimant is empty".to_string()));
        }

        let claim = ExclusionClaim {
            claimant: claimant.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        };

        let removed = {
            let mut exclusions = self.exclusions.write().await;
            exclusions.insert(id.clone(), claim);
            self.registry.detach(id).await
        };

        if let Some(record) = &removed {
            self.registry.announce_removed(&record.id).await;
        }

        event!(
            Level::INFO,
            entity_id = %id,
            claimant,
            reason,
            removed = removed.is_some(),
            "exclusion claimed"
        );
        Ok(removed)
    }

    pub async fn release_exclusion(&self, id: &EntityId) -> bool {
        let released = self.exclusions.release(id).await;
        if released {
            event!(Level::INFO, entity_id = %id, "exclusion released");
        }
        released
    }

    pub async fn is_excluded(&self, id: &EntityId) -> bool {
        self.exclusions.is_claimed(id).await
    }

    pub async fn exclusion(&self, id: &EntityId) -> Option<ExclusionClaim> {
        self.exclusions.get(id).await
    }

    pub async fn exclusions(&self) -> Vec<(EntityId, ExclusionClaim)> {
        self.exclusions.list().await
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub async fn claim_lock(&self, id: &EntityId, claimant: &str) -> Result<()> {
        self.claim_lock_at(id, claimant, Utc::now()).await
    }

    /// Upserts a lock; re-claiming refreshes `locked_at`. Never touches the
    /// registry.
    pub async fn claim_lock_at(&self, id: &EntityId, claimant: &str, now: DateTime<Utc>) -> Result<()> {
        if claimant.trim().is_empty() {
            return Err(PersistError::Validation("claimant is empty".to_string()));
        }
        self.locks
            .claim(
                id.clone(),
                LockClaim {
                    claimant: claimant.to_string(),
                    locked_at: now,
                },
            )
            .await;
        event!(Level::DEBUG, entity_id = %id, claimant, "lock claimed");
        Ok(())
    }

    pub async fn release_lock(&self, id: &EntityId) -> bool {
        self.locks.release(id).await
    }

    pub async fn is_locked(&self, id: &EntityId) -> bool {
        self.lock_at(id, Utc::now()).await.is_some()
    }

    pub async fn lock(&self, id: &EntityId) -> Option<LockClaim> {
        self.lock_at(id, Utc::now()).await
    }

    /// Live lock on `id` at `now`. A lock past its TTL reads as absent even
    /// before the sweep has removed it.
    pub async fn lock_at(&self, id: &EntityId, now: DateTime<Utc>) -> Option<LockClaim> {
        self.locks
            .get(id)
            .await
            .filter(|claim| !claim.is_expired_at(now, self.lock_ttl))
    }

    pub async fn sweep_expired_locks(&self) -> Vec<EntityId> {
        self.sweep_expired_locks_at(Utc::now()).await
    }

    /// Removes locks older than the TTL. Exclusions are never touched.
    pub async fn sweep_expired_locks_at(&self, now: DateTime<Utc>) -> Vec<EntityId> {
        let ttl = self.lock_ttl;
        let expired = self
            .locks
            .remove_where(|claim| claim.is_expired_at(now, ttl))
            .await;
        if !expired.is_empty() {
            self.locks_expired_total
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            event!(Level::INFO, expired = expired.len(), "expired locks swept");
        }
        expired
    }

    pub fn locks_expired_total(&self) -> u64 {
        self.locks_expired_total.load(Ordering::Relaxed)
    }

    pub async fn exclusion_count(&self) -> usize {
        self.exclusions.len().await
    }

    pub async fn lock_count(&self) -> usize {
        self.locks.len().await
    }

    // ------------------------------------------------------------------
    // Aggregate view
    // ------------------------------------------------------------------

    pub async fn status(&self, id: &EntityId) -> EntityStatus {
        self.status_at(id, Utc::now()).await
    }

    pub async fn status_at(&self, id: &EntityId, now: DateTime<Utc>) -> EntityStatus {
        let exclusions = self.exclusions.read().await;
        let locks = self.locks.read().await;
        let exclusion = exclusions.get(id).cloned();
        let lock = locks
            .get(id)
            .filter(|claim| !claim.is_expired_at(now, self.lock_ttl))
            .cloned();
        let record = self.registry.get(id).await;
        drop(locks);
        drop(exclusions);

        EntityStatus {
            tracked: record.is_some(),
            excluded: exclusion.is_some(),
            locked: lock.is_some(),
            exclusion,
            lock,
            record,
        }
    }
}
