//! Service object wiring every component together behind the calls that
//! game-side collaborators make.

use crate::config::EngineConfig;
use crate::coordination::{ClaimTable, Coordinator};
use crate::core::{
    ConditionDelta, EntityId, EntityRecord, EntityStatus, EntitySummary, ExclusionClaim,
    LockClaim, OwnerId, PersistError, Result, WorldHandle,
};
use crate::materialize::{ReplayLoader, ReplayReport, WorldMaterializer};
use crate::orphan::{OrphanReport, OrphanSweeper, OwnedEntityMutator, OwnerActivity};
use crate::propagation::{LivePropertySource, ObserverChannel, PropagationGateway, Publisher};
use crate::registry::{CapacityPolicy, EntityRegistry, UpsertOutcome};
use crate::storage::{DurableStore, FlushReport, WriteThrough};
use crate::worker::{PeriodicWorker, spawn_periodic};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// External systems the engine talks to.
pub struct Collaborators {
    pub store: Arc<dyn DurableStore>,
    pub activity: Arc<dyn OwnerActivity>,
    pub mutator: Arc<dyn OwnedEntityMutator>,
    pub materializer: Arc<dyn WorldMaterializer>,
    pub observers: Arc<dyn ObserverChannel>,
    pub live: Option<Arc<dyn LivePropertySource>>,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub tracked: usize,
    pub exclusions: usize,
    pub locks: usize,
    pub pending_writes: usize,
    pub writes_total: u64,
    pub write_failures_total: u64,
    pub evictions_total: u64,
    pub locks_expired_total: u64,
    pub impounded_total: u64,
    pub orphans_deleted_total: u64,
    pub projections_published_total: u64,
}

pub struct PersistenceEngine {
    config: EngineConfig,
    writer: Arc<WriteThrough>,
    registry: Arc<EntityRegistry>,
    coordinator: Arc<Coordinator>,
    gateway: Arc<PropagationGateway>,
    sweeper: Arc<OrphanSweeper>,
    replay: Arc<ReplayLoader>,
    started: AtomicBool,
    workers: Mutex<Vec<PeriodicWorker>>,
    replay_task: Mutex<Option<JoinHandle<Result<ReplayReport>>>>,
}

impl PersistenceEngine {
    /// Builds the engine. Nothing is loaded and no timer runs until
    /// [`start`](Self::start).
    pub fn open(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            store,
            activity,
            mutator,
            materializer,
            observers,
            live,
        } = collaborators;

        let writer = Arc::new(WriteThrough::new(store, config.retry.clone()));
        let publisher = Arc::new(Publisher::new(observers));
        let exclusions = Arc::new(ClaimTable::<ExclusionClaim>::new());
        let locks = Arc::new(ClaimTable::<LockClaim>::new());

        let registry = Arc::new(EntityRegistry::new(
            exclusions.clone(),
            CapacityPolicy::new(config.max_vehicles_per_player),
            writer.clone(),
            publisher.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            exclusions,
            locks,
            registry.clone(),
            config.lock_ttl_duration(),
        ));
        let gateway = Arc::new(PropagationGateway::new(
            registry.clone(),
            publisher.clone(),
            live,
            config.live_fetch_timeout_duration(),
        ));
        let sweeper = Arc::new(OrphanSweeper::new(
            registry.clone(),
            activity,
            mutator,
            config.orphan.clone(),
        ));
        let replay = Arc::new(ReplayLoader::new(
            materializer,
            registry.clone(),
            publisher,
            config.spawn_delay_duration(),
        ));

        Ok(Self {
            config,
            writer,
            registry,
            coordinator,
            gateway,
            sweeper,
            replay,
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            replay_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn gateway(&self) -> &Arc<PropagationGateway> {
        &self.gateway
    }

    pub fn writer(&self) -> &Arc<WriteThrough> {
        &self.writer
    }

    /// Loads the durable store, starts the background timers and kicks off
    /// world replay in the background. Returns how many records were loaded.
    pub async fn start(&self) -> Result<usize> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PersistError::AlreadyRunning("engine already started".to_string()));
        }

        let loaded = match self.registry.load_all().await {
            Ok(loaded) => loaded,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let count = loaded.len();

        let mut workers = self.workers.lock().await;

        let writer = self.writer.clone();
        workers.push(spawn_periodic(
            "write-flush",
            self.config.write_flush_period(),
            move || {
                let writer = writer.clone();
                async move {
                    writer.process_due().await;
                }
            },
        ));

        let coordinator = self.coordinator.clone();
        workers.push(spawn_periodic(
            "lock-sweep",
            self.config.lock_sweep_period(),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    coordinator.sweep_expired_locks().await;
                }
            },
        ));

        if self.config.orphan.enabled {
            let sweeper = self.sweeper.clone();
            workers.push(spawn_periodic(
                "orphan-sweep",
                self.config.orphan.check_interval(),
                move || {
                    let sweeper = sweeper.clone();
                    async move {
                        if let Err(err) = sweeper.sweep().await {
                            event!(Level::WARN, error = %err, "orphan sweep failed");
                        }
                    }
                },
            ));
        }
        drop(workers);

        let replay = self.replay.clone();
        *self.replay_task.lock().await = Some(tokio::spawn(async move { replay.replay(loaded).await }));

        event!(Level::INFO, loaded = count, "persistence engine started");
        Ok(count)
    }

    /// Waits for the startup replay, if one was started and is still owed.
    pub async fn wait_for_replay(&self) -> Result<Option<ReplayReport>> {
        let Some(task) = self.replay_task.lock().await.take() else {
            return Ok(None);
        };
        let report = task
            .await
            .map_err(|err| PersistError::Worker(format!("replay join: {}", err)))??;
        Ok(Some(report))
    }

    /// Stops the timers and drains pending durable writes.
    pub async fn shutdown(&self) -> Result<FlushReport> {
        if let Some(task) = self.replay_task.lock().await.take() {
            task.abort();
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            let name = worker.name();
            if let Err(err) = worker.stop().await {
                event!(Level::WARN, worker = name, error = %err, "worker did not stop cleanly");
            }
        }

        let report = self.writer.drain().await;
        self.started.store(false, Ordering::SeqCst);
        if report.still_pending > 0 {
            event!(
                Level::ERROR,
                pending = report.still_pending,
                "shutdown left durable writes unflushed"
            );
        } else {
            event!(Level::INFO, written = report.written, "persistence engine stopped");
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Owner-facing saves
    // ------------------------------------------------------------------

    /// The owner parked (or otherwise saved) a vehicle.
    pub async fn record_parked(&self, owner_id: &str, record: EntityRecord) -> UpsertOutcome {
        self.registry.upsert(&OwnerId::from(owner_id), record).await
    }

    /// The vehicle went into a garage and is no longer a world object.
    pub async fn record_stored(&self, id: &str) -> bool {
        match parse_id(id) {
            Some(id) => self.registry.remove(&id).await,
            None => false,
        }
    }

    /// The vehicle was destroyed in the world.
    pub async fn record_destroyed(&self, id: &str) -> bool {
        match parse_id(id) {
            Some(id) => self.registry.remove(&id).await,
            None => false,
        }
    }

    pub async fn set_being_used(&self, id: &str, being_used: bool) -> bool {
        let Some(id) = parse_id(id) else {
            return false;
        };
        self.registry
            .set_being_used(&id, being_used)
            .await
            .is_some_and(|outcome| outcome.is_saved())
    }

    /// Parks every vehicle the owner was driving and asks the controlling
    /// clients for fresh properties. Returns how many were re-saved.
    pub async fn owner_disconnected(&self, owner_id: &str) -> usize {
        let owner_id = OwnerId::from(owner_id);
        let mut parked = 0;
        for record in self.registry.list_for_owner(&owner_id).await {
            if !record.being_used {
                continue;
            }
            if self
                .registry
                .set_being_used(&record.id, false)
                .await
                .is_some_and(|outcome| outcome.is_saved())
            {
                parked += 1;
                self.gateway.spawn_refresh(record.id.clone());
            }
        }
        event!(Level::INFO, owner_id = %owner_id, parked, "owner disconnected");
        parked
    }

    // ------------------------------------------------------------------
    // Coordination
    // ------------------------------------------------------------------

    pub async fn claim_exclusion(&self, id: &str, claimant: &str, reason: &str) -> bool {
        let Some(id) = parse_id(id) else {
            return false;
        };
        match self.coordinator.claim_exclusion(&id, claimant, reason).await {
            Ok(_) => true,
            Err(err) => {
                event!(Level::WARN, entity_id = %id, error = %err, "exclusion refused");
                false
            }
        }
    }

    pub async fn release_exclusion(&self, id: &str) -> bool {
        match parse_id(id) {
            Some(id) => self.coordinator.release_exclusion(&id).await,
            None => false,
        }
    }

    pub async fn is_excluded(&self, id: &str) -> bool {
        match parse_id(id) {
            Some(id) => self.coordinator.is_excluded(&id).await,
            None => false,
        }
    }

    pub async fn exclusion(&self, id: &str) -> Option<ExclusionClaim> {
        self.coordinator.exclusion(&parse_id(id)?).await
    }

    pub async fn claim_lock(&self, id: &str, claimant: &str) -> bool {
        let Some(id) = parse_id(id) else {
            return false;
        };
        match self.coordinator.claim_lock(&id, claimant).await {
            Ok(()) => true,
            Err(err) => {
                event!(Level::WARN, entity_id = %id, error = %err, "lock refused");
                false
            }
        }
    }

    pub async fn release_lock(&self, id: &str) -> bool {
        match parse_id(id) {
            Some(id) => self.coordinator.release_lock(&id).await,
            None => false,
        }
    }

    pub async fn is_locked(&self, id: &str) -> bool {
        match parse_id(id) {
            Some(id) => self.coordinator.is_locked(&id).await,
            None => false,
        }
    }

    pub async fn lock(&self, id: &str) -> Option<LockClaim> {
        self.coordinator.lock(&parse_id(id)?).await
    }

    /// Invalid plates report as untracked and unclaimed.
    pub async fn status(&self, id: &str) -> EntityStatus {
        match parse_id(id) {
            Some(id) => self.coordinator.status(&id).await,
            None => EntityStatus::default(),
        }
    }

    // ------------------------------------------------------------------
    // Queries and admin
    // ------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Option<EntityRecord> {
        self.registry.get(&parse_id(id)?).await
    }

    pub async fn list_all(&self) -> Vec<EntityRecord> {
        self.registry.list().await
    }

    /// Id, owner and model of every tracked vehicle, sorted by id.
    pub async fn list_summaries(&self) -> Vec<EntitySummary> {
        let mut summaries = self
            .registry
            .list()
            .await
            .iter()
            .map(EntityRecord::summary)
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub async fn clear_all(&self) -> usize {
        self.registry.clear().await
    }

    // ------------------------------------------------------------------
    // Propagation
    // ------------------------------------------------------------------

    pub async fn bind_handle(&self, id: &str, handle: WorldHandle) -> bool {
        let Some(id) = parse_id(id) else {
            return false;
        };
        self.gateway.bind_handle(id, handle).await;
        true
    }

    pub async fn unbind_handle(&self, id: &str) -> bool {
        match parse_id(id) {
            Some(id) => self.gateway.unbind_handle(&id).await.is_some(),
            None => false,
        }
    }

    pub async fn on_condition_update(&self, id: &str, delta: ConditionDelta) -> bool {
        match parse_id(id) {
            Some(id) => self.gateway.on_condition_update(&id, delta).await,
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Maintenance, normally driven by the timers
    // ------------------------------------------------------------------

    pub async fn run_orphan_sweep(&self) -> Result<OrphanReport> {
        self.sweeper.sweep().await
    }

    pub async fn sweep_expired_locks(&self) -> usize {
        self.coordinator.sweep_expired_locks().await.len()
    }

    /// Writes every pending durable operation now, ignoring backoff.
    pub async fn flush(&self) -> FlushReport {
        self.writer.flush().await
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            tracked: self.registry.len().await,
            exclusions: self.coordinator.exclusion_count().await,
            locks: self.coordinator.lock_count().await,
            pending_writes: self.writer.pending_len().await,
            writes_total: self.writer.written_total(),
            write_failures_total: self.writer.failures_total(),
            evictions_total: self.registry.evictions_total(),
            locks_expired_total: self.coordinator.locks_expired_total(),
            impounded_total: self.sweeper.impounded_total(),
            orphans_deleted_total: self.sweeper.deleted_total(),
            projections_published_total: self.gateway.publisher().published_total(),
        }
    }
}

fn parse_id(raw: &str) -> Option<EntityId> {
    match EntityId::parse(raw) {
        Ok(id) => Some(id),
        Err(err) => {
            event!(Level::WARN, plate = raw, error = %err, "ignoring request for invalid plate");
            None
        }
    }
}
