//! In-memory source of truth for every tracked vehicle.

pub mod capacity;

pub use capacity::CapacityPolicy;

use crate::coordination::ClaimTable;
use crate::core::{
    ConditionDelta, EntityId, EntityRecord, ExclusionClaim, OwnerId, PersistError, Result,
};
use crate::propagation::{LiveProperties, Publisher};
use crate::storage::WriteThrough;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{Level, event};

/// Result of a park/save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Stored; `evicted` lists records removed to respect the owner's cap.
    Saved { evicted: Vec<EntityId> },
    /// The id carries an exclusion claim and is not tracked.
    Excluded,
    /// The request was malformed (e.g. empty owner) and ignored.
    Rejected,
}

impl UpsertOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, UpsertOutcome::Saved { .. })
    }
}

pub struct EntityRegistry {
    records: RwLock<HashMap<EntityId, EntityRecord>>,
    exclusions: Arc<ClaimTable<ExclusionClaim>>,
    capacity: CapacityPolicy,
    writer: Arc<WriteThrough>,
    publisher: Arc<Publisher>,
    loaded: AtomicBool,
    evictions_total: AtomicU64,
}

impl EntityRegistry {
    pub fn new(
        exclusions: Arc<ClaimTable<ExclusionClaim>>,
        capacity: CapacityPolicy,
        writer: Arc<WriteThrough>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            exclusions,
            capacity,
            writer,
            publisher,
            loaded: AtomicBool::new(false),
            evictions_total: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> CapacityPolicy {
        self.capacity
    }

    /// Populates memory from the durable store. Runs once per process; the
    /// loaded records are returned for world replay.
    pub async fn load_all(&self) -> Result<Vec<EntityRecord>> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Err(PersistError::AlreadyRunning(
                "registry already loaded".to_string(),
            ));
        }

        let stored = match self.writer.store().load_all().await {
            Ok(stored) => stored,
            Err(err) => {
                self.loaded.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let exclusions = self.exclusions.read().await;
        let mut records = self.records.write().await;
        let mut loaded = Vec::with_capacity(stored.len());
        for mut record in stored {
            if exclusions.contains_key(&record.id) {
                continue;
            }
            record.being_used = false;
            records.insert(record.id.clone(), record.clone());
            loaded.push(record);
        }

        event!(Level::INFO, loaded = loaded.len(), "registry loaded from durable store");
        Ok(loaded)
    }

    pub async fn upsert(&self, owner_id: &OwnerId, record: EntityRecord) -> UpsertOutcome {
        self.upsert_at(owner_id, record, Utc::now()).await
    }

    /// Inserts or replaces the record for `record.id` on behalf of `owner_id`.
    ///
    /// Excluded ids are refused. A parked (not driven) record first runs the
    /// capacity policy for its owner. `saved_at` becomes `now`, or stays put
    /// if the previous save is somehow later.
    pub async fn upsert_at(
        &self,
        owner_id: &OwnerId,
        mut record: EntityRecord,
        now: DateTime<Utc>,
    ) -> UpsertOutcome {
        if owner_id.is_empty() {
            event!(Level::WARN, entity_id = %record.id, "upsert ignored: empty owner id");
            return UpsertOutcome::Rejected;
        }

        record.owner_id = owner_id.clone();
        record.condition = record.condition.normalized();

        let (saved, evicted) = {
            let exclusions = self.exclusions.read().await;
            if exclusions.contains_key(&record.id) {
                event!(Level::DEBUG, entity_id = %record.id, "upsert ignored: entity excluded");
                return UpsertOutcome::Excluded;
            }

            let mut records = self.records.write().await;
            let evicted = if record.being_used {
                Vec::new()
            } else {
                self.capacity
                    .select_evictions(&records, owner_id, &record.id)
            };
            for id in &evicted {
                records.remove(id);
                self.writer.enqueue_delete(id.clone()).await;
            }

            record.saved_at = match records.get(&record.id) {
                Some(previous) => previous.saved_at.max(now),
                None => now,
            };
            records.insert(record.id.clone(), record.clone());
            self.writer.enqueue_put(record.clone()).await;
            (record, evicted)
        };

        for id in &evicted {
            self.evictions_total.fetch_add(1, Ordering::Relaxed);
            event!(
                Level::INFO,
                entity_id = %id,
                owner_id = %owner_id,
                "evicted oldest parked vehicle over capacity"
            );
            self.publisher.publish_removed(id).await;
        }
        self.publisher.publish_tracked(&saved).await;

        UpsertOutcome::Saved { evicted }
    }

    /// Removes `id` from memory and the durable store. Idempotent.
    pub async fn remove(&self, id: &EntityId) -> bool {
        let removed = self.detach(id).await;
        if removed.is_some() {
            self.announce_removed(id).await;
        }
        removed.is_some()
    }

    /// Removes `id` only if it was not saved again since `saved_at`.
    pub async fn remove_if_saved_at(&self, id: &EntityId, saved_at: DateTime<Utc>) -> bool {
        let removed = {
            let mut records = self.records.write().await;
            match records.get(id) {
                Some(current) if current.saved_at == saved_at => {
                    records.remove(id);
                    self.writer.enqueue_delete(id.clone()).await;
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.announce_removed(id).await;
        }
        removed
    }

    /// Memory removal plus the durable delete, without publishing. Callers
    /// holding the exclusion table use this, then [`announce_removed`](Self::announce_removed).
    pub(crate) async fn detach(&self, id: &EntityId) -> Option<EntityRecord> {
        let mut records = self.records.write().await;
        let removed = records.remove(id);
        if removed.is_some() {
            self.writer.enqueue_delete(id.clone()).await;
        }
        removed
    }

    pub(crate) async fn announce_removed(&self, id: &EntityId) {
        self.publisher.publish_removed(id).await;
    }

    pub async fn get(&self, id: &EntityId) -> Option<EntityRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &EntityId) -> bool {
        self.records.read().await.contains_key(id)
    }

    /// Snapshot of every record, unordered.
    pub async fn list(&self) -> Vec<EntityRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn list_for_owner(&self, owner_id: &OwnerId) -> Vec<EntityRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| &r.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Folds a condition report into the record without touching `saved_at`.
    pub async fn merge_condition(&self, id: &EntityId, delta: ConditionDelta) -> Option<EntityRecord> {
        let updated = {
            let mut records = self.records.write().await;
            let record = records.get_mut(id)?;
            record.condition.merge(&delta);
            let updated = record.clone();
            self.writer.enqueue_put(updated.clone()).await;
            updated
        };
        self.publisher.publish_tracked(&updated).await;
        Some(updated)
    }

    /// Flags the vehicle as driven or parked. Going back to parked runs the
    /// capacity policy like any other park.
    pub async fn set_being_used(&self, id: &EntityId, being_used: bool) -> Option<UpsertOutcome> {
        let record = self.get(id).await?;
        if record.being_used == being_used {
            return Some(UpsertOutcome::Saved {
                evicted: Vec::new(),
            });
        }
        let owner_id = record.owner_id.clone();
        Some(self.upsert(&owner_id, record.in_use(being_used)).await)
    }

    /// Saves properties read back from the controlling client.
    pub async fn apply_live(&self, id: &EntityId, props: LiveProperties) -> bool {
        let now = Utc::now();
        let updated = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(id) else {
                return false;
            };
            record.position = props.position;
            record.heading = props.heading;
            if let Some(configuration) = props.configuration {
                record.configuration = configuration;
            }
            if let Some(condition) = props.condition {
                record.condition = condition.normalized();
            }
            record.saved_at = record.saved_at.max(now);
            let updated = record.clone();
            self.writer.enqueue_put(updated.clone()).await;
            updated
        };
        self.publisher.publish_tracked(&updated).await;
        true
    }

    /// Drops every record. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let removed = {
            let mut records = self.records.write().await;
            let ids = records.drain().map(|(id, _)| id).collect::<Vec<_>>();
            for id in &ids {
                self.writer.enqueue_delete(id.clone()).await;
            }
            ids
        };
        for id in &removed {
            self.publisher.publish_removed(id).await;
        }
        event!(Level::WARN, removed = removed.len(), "registry cleared");
        removed.len()
    }

    pub fn evictions_total(&self) -> u64 {
        self.evictions_total.load(Ordering::Relaxed)
    }
}
