use super::DurableStore;
use crate::core::{EntityId, EntityRecord, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store. Used by tests and by embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<EntityId, EntityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `records`, as if a previous process had saved them.
    pub fn with_records(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn get(&self, id: &EntityId) -> Option<EntityRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, record: &EntityRecord) -> Result<()> {
        let mut stored = record.clone();
        stored.being_used = false;
        self.records.write().await.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<EntityRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
