//! Pushes a minimal view of registry state to observers of each world
//! object and takes condition reports back.

use crate::core::{Condition, ConditionDelta, EntityId, EntityRecord, OwnerId, Vec3, WorldHandle};
use crate::registry::EntityRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::time::{Duration, timeout};
use tracing::{Level, event};

/// What observers of a world object learn about its persistence state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub id: EntityId,
    pub tracked: bool,
    pub owner_id: Option<OwnerId>,
    /// Low-frequency fields; absent once the record is no longer tracked.
    pub condition: Option<Condition>,
}

impl Projection {
    pub fn tracked(record: &EntityRecord) -> Self {
        Self {
            id: record.id.clone(),
            tracked: true,
            owner_id: Some(record.owner_id.clone()),
            condition: Some(record.condition),
        }
    }

    pub fn untracked(id: &EntityId) -> Self {
        Self {
            id: id.clone(),
            tracked: false,
            owner_id: None,
            condition: None,
        }
    }
}

/// Transport to whoever observes a world object. Fire-and-forget.
pub trait ObserverChannel: Send + Sync {
    fn publish(&self, handle: WorldHandle, projection: &Projection);
}

/// Channel for hosts with no observers attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ObserverChannel for NullObserver {
    fn publish(&self, _handle: WorldHandle, _projection: &Projection) {}
}

/// Properties read back from the client currently controlling a vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveProperties {
    pub position: Vec3,
    pub heading: f32,
    pub configuration: Option<Vec<u8>>,
    pub condition: Option<Condition>,
}

/// One-shot request for live properties of a world object.
#[async_trait]
pub trait LivePropertySource: Send + Sync {
    async fn fetch(&self, handle: WorldHandle) -> Option<LiveProperties>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveFetch {
    Fresh(LiveProperties),
    /// No answer in time (or nobody to ask); the cached record stays as is.
    Unknown,
}

/// Asks `source` once, giving up after `limit`.
pub async fn fetch_live(
    source: &dyn LivePropertySource,
    handle: WorldHandle,
    limit: Duration,
) -> LiveFetch {
    match timeout(limit, source.fetch(handle)).await {
        Ok(Some(props)) => LiveFetch::Fresh(props),
        Ok(None) => LiveFetch::Unknown,
        Err(_) => {
            event!(Level::DEBUG, handle = %handle, "live property request timed out");
            LiveFetch::Unknown
        }
    }
}

/// Handle directory plus the outbound side of the gateway. The registry
/// publishes through this on every successful upsert and removal.
pub struct Publisher {
    channel: Arc<dyn ObserverChannel>,
    handles: RwLock<HashMap<EntityId, WorldHandle>>,
    published_total: AtomicU64,
}

impl Publisher {
    pub fn new(channel: Arc<dyn ObserverChannel>) -> Self {
        Self {
            channel,
            handles: RwLock::new(HashMap::new()),
            published_total: AtomicU64::new(0),
        }
    }

    pub async fn bind(&self, id: EntityId, handle: WorldHandle) -> Option<WorldHandle> {
        self.handles.write().await.insert(id, handle)
    }

    pub async fn unbind(&self, id: &EntityId) -> Option<WorldHandle> {
        self.handles.write().await.remove(id)
    }

    pub async fn handle(&self, id: &EntityId) -> Option<WorldHandle> {
        self.handles.read().await.get(id).copied()
    }

    pub async fn publish_tracked(&self, record: &EntityRecord) {
        if let Some(handle) = self.handle(&record.id).await {
            self.channel.publish(handle, &Projection::tracked(record));
            self.published_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Tells observers the record is gone and forgets its handle.
    pub async fn publish_removed(&self, id: &EntityId) {
        if let Some(handle) = self.unbind(id).await {
            self.channel.publish(handle, &Projection::untracked(id));
            self.published_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn published_total(&self) -> u64 {
        self.published_total.load(Ordering::Relaxed)
    }
}

/// Read-mostly facade over the registry for observers.
pub struct PropagationGateway {
    registry: Arc<EntityRegistry>,
    publisher: Arc<Publisher>,
    live: Option<Arc<dyn LivePropertySource>>,
    live_timeout: Duration,
}

impl PropagationGateway {
    pub fn new(
        registry: Arc<EntityRegistry>,
        publisher: Arc<Publisher>,
        live: Option<Arc<dyn LivePropertySource>>,
        live_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            publisher,
            live,
            live_timeout,
        }
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Associates a world object with `id` and sends it the current projection.
    pub async fn bind_handle(&self, id: EntityId, handle: WorldHandle) {
        self.publisher.bind(id.clone(), handle).await;
        if let Some(record) = self.registry.get(&id).await {
            self.publisher.publish_tracked(&record).await;
        }
    }

    /// The world object went away while the record stays tracked.
    pub async fn unbind_handle(&self, id: &EntityId) -> Option<WorldHandle> {
        self.publisher.unbind(id).await
    }

    /// Inbound damage sync. Returns false when `id` is not tracked.
    pub async fn on_condition_update(&self, id: &EntityId, delta: ConditionDelta) -> bool {
        self.registry.merge_condition(id, delta).await.is_some()
    }

    /// Requests live properties from the controlling client and saves them
    /// when they arrive in time.
    pub async fn refresh_from_controller(&self, id: &EntityId) -> LiveFetch {
        let (Some(source), Some(handle)) = (self.live.as_ref(), self.publisher.handle(id).await)
        else {
            return LiveFetch::Unknown;
        };

        let fetched = fetch_live(source.as_ref(), handle, self.live_timeout).await;
        if let LiveFetch::Fresh(props) = &fetched {
            if !self.registry.apply_live(id, props.clone()).await {
                event!(Level::DEBUG, entity_id = %id, "live properties arrived for untracked entity");
            }
        }
        fetched
    }

    /// Fire-and-forget variant of [`refresh_from_controller`](Self::refresh_from_controller).
    pub fn spawn_refresh(self: &Arc<Self>, id: EntityId) {
        if self.live.is_none() {
            return;
        }
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.refresh_from_controller(&id).await;
        });
    }
}
