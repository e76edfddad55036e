#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::time::Instant;
use vehicle_persist::{
    Collaborators, DurableStore, EngineConfig, EntityId, EntityRecord, LiveProperties,
    LivePropertySource, MemoryStore, ObserverChannel, OwnedEntityMutator, OwnerActivity, OwnerId,
    PersistError, PersistenceEngine, Projection, Result, WorldHandle, WorldMaterializer,
};

pub fn plate(raw: &str) -> EntityId {
    EntityId::parse(raw).unwrap()
}

pub fn vehicle(raw: &str, owner: &str) -> EntityRecord {
    EntityRecord::new(plate(raw), owner, "sultan")
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

#[derive(Default)]
pub struct RecordingObserver {
    published: Mutex<Vec<(WorldHandle, Projection)>>,
}

impl RecordingObserver {
    pub fn published(&self) -> Vec<(WorldHandle, Projection)> {
        self.published.lock().unwrap().clone()
    }

    pub fn last_for(&self, handle: WorldHandle) -> Option<Projection> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(h, _)| *h == handle)
            .map(|(_, p)| p.clone())
    }
}

impl ObserverChannel for RecordingObserver {
    fn publish(&self, handle: WorldHandle, projection: &Projection) {
        self.published.lock().unwrap().push((handle, projection.clone()));
    }
}

type LookupHook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Owner activity from a fixed table; owners in `failing` make the lookup error.
/// A hook set with `during_lookup` runs inside every lookup, before `delay`.
#[derive(Default)]
pub struct FixedActivity {
    last_seen: Mutex<HashMap<OwnerId, DateTime<Utc>>>,
    failing: Mutex<HashSet<OwnerId>>,
    delay: Mutex<Option<StdDuration>>,
    hook: Mutex<Option<LookupHook>>,
}

impl FixedActivity {
    pub fn seen(&self, owner: &str, at: DateTime<Utc>) {
        self.last_seen.lock().unwrap().insert(owner.into(), at);
    }

    pub fn fail_for(&self, owner: &str) {
        self.failing.lock().unwrap().insert(owner.into());
    }

    pub fn answer_after(&self, delay: Option<StdDuration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn during_lookup<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.hook.lock().unwrap() = Some(Box::new(move || Box::pin(hook())));
    }
}

#[async_trait]
impl OwnerActivity for FixedActivity {
    async fn last_active_at(&self, owner_id: &OwnerId) -> Result<Option<DateTime<Utc>>> {
        let hook = self.hook.lock().unwrap().as_ref().map(|hook| hook());
        if let Some(hook) = hook {
            hook.await;
        }
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(owner_id) {
            return Err(PersistError::Collaborator("identity backend down".to_string()));
        }
        Ok(self.last_seen.lock().unwrap().get(owner_id).copied())
    }
}

/// Records impound calls; answers with `rows` affected, or errors when `rows`
/// is `u64::MAX`.
pub struct RecordingMutator {
    pub calls: Mutex<Vec<(EntityId, String, u64)>>,
    rows: AtomicU64,
}

impl Default for RecordingMutator {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rows: AtomicU64::new(1),
        }
    }
}

impl RecordingMutator {
    pub fn answer_rows(&self, rows: u64) {
        self.rows.store(rows, Ordering::SeqCst);
    }

    pub fn fail(&self) {
        self.rows.store(u64::MAX, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(EntityId, String, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OwnedEntityMutator for RecordingMutator {
    async fn mark_impounded(&self, id: &EntityId, lot: &str, fee: u64) -> Result<u64> {
        self.calls
            .lock()
            .unwrap()
            .push((id.clone(), lot.to_string(), fee));
        match self.rows.load(Ordering::SeqCst) {
            u64::MAX => Err(PersistError::Collaborator("ownership store offline".to_string())),
            rows => Ok(rows),
        }
    }
}

/// Hands out sequential handles and remembers when each spawn happened.
#[derive(Default)]
pub struct CountingMaterializer {
    next: AtomicU64,
    pub spawns: Mutex<Vec<(EntityId, Instant)>>,
    failing: Mutex<HashSet<EntityId>>,
}

impl CountingMaterializer {
    pub fn fail_for(&self, raw: &str) {
        self.failing.lock().unwrap().insert(plate(raw));
    }

    pub fn spawned(&self) -> Vec<EntityId> {
        self.spawns
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl WorldMaterializer for CountingMaterializer {
    async fn spawn(&self, record: &EntityRecord) -> Result<WorldHandle> {
        if self.failing.lock().unwrap().contains(&record.id) {
            return Err(PersistError::Collaborator("model not streamed".to_string()));
        }
        self.spawns
            .lock()
            .unwrap()
            .push((record.id.clone(), Instant::now()));
        Ok(WorldHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

/// Answers every live property request with the same properties.
pub struct FixedLive(pub LiveProperties);

#[async_trait]
impl LivePropertySource for FixedLive {
    async fn fetch(&self, _handle: WorldHandle) -> Option<LiveProperties> {
        Some(self.0.clone())
    }
}

pub struct Harness {
    pub engine: PersistenceEngine,
    pub observer: Arc<RecordingObserver>,
    pub activity: Arc<FixedActivity>,
    pub mutator: Arc<RecordingMutator>,
    pub materializer: Arc<CountingMaterializer>,
}

pub fn harness(config: EngineConfig) -> (Harness, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (harness_with(config, store.clone(), None), store)
}

pub fn harness_with(
    config: EngineConfig,
    store: Arc<dyn DurableStore>,
    live: Option<Arc<dyn LivePropertySource>>,
) -> Harness {
    let observer = Arc::new(RecordingObserver::default());
    let activity = Arc::new(FixedActivity::default());
    let mutator = Arc::new(RecordingMutator::default());
    let materializer = Arc::new(CountingMaterializer::default());

    let engine = PersistenceEngine::open(
        config,
        Collaborators {
            store,
            activity: activity.clone(),
            mutator: mutator.clone(),
            materializer: materializer.clone(),
            observers: observer.clone(),
            live,
        },
    )
    .unwrap();

    Harness {
        engine,
        observer,
        activity,
        mutator,
        materializer,
    }
}
