//! Durable storage adapters and the write-through path in front of them.

pub mod journal;
pub mod memory;
pub mod writer;

pub use journal::JournalStore;
pub use memory::MemoryStore;
pub use writer::{FlushReport, WriteOp, WriteThrough};

use crate::core::{EntityId, EntityRecord, Result};
use async_trait::async_trait;

/// Key-addressed persistence of vehicle records - allows pluggable backends.
///
/// Implementations carry no business rules. They must tolerate being called
/// from the eviction and orphan paths concurrently with ordinary saves.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or replace the record stored under `record.id`.
    async fn put(&self, record: &EntityRecord) -> Result<()>;

    /// Remove the record stored under `id`. Absent ids are not an error.
    async fn delete(&self, id: &EntityId) -> Result<()>;

    /// Every stored record, in no particular order.
    async fn load_all(&self) -> Result<Vec<EntityRecord>>;
}
