use crate::core::EntityId;
use std::collections::HashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Claims keyed by entity id behind one table-wide lock.
///
/// Used twice by the coordinator: once for permanent exclusions and once for
/// TTL'd locks. The table itself has no expiry or side effects.
pub struct ClaimTable<C> {
    claims: RwLock<HashMap<EntityId, C>>,
}

impl<C> Default for ClaimTable<C> {
    fn default() -> Self {
        Self {
            claims: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Clone> ClaimTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the claim on `id`, returning the previous one.
    pub async fn claim(&self, id: EntityId, claim: C) -> Option<C> {
        self.claims.write().await.insert(id, claim)
    }

    pub async fn release(&self, id: &EntityId) -> bool {
        self.claims.write().await.remove(id).is_some()
    }

    pub async fn is_claimed(&self, id: &EntityId) -> bool {
        self.claims.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &EntityId) -> Option<C> {
        self.claims.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.claims.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.claims.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<(EntityId, C)> {
        self.claims
            .read()
            .await
            .iter()
            .map(|(id, claim)| (id.clone(), claim.clone()))
            .collect()
    }

    /// Removes every claim matching `expired`, returning the removed ids.
    pub async fn remove_where<F>(&self, mut expired: F) -> Vec<EntityId>
    where
        F: FnMut(&C) -> bool,
    {
        let mut claims = self.claims.write().await;
        let doomed = claims
            .iter()
            .filter(|(_, claim)| expired(claim))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in &doomed {
            claims.remove(id);
        }
        doomed
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, HashMap<EntityId, C>> {
        self.claims.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, HashMap<EntityId, C>> {
        self.claims.write().await
    }
}
