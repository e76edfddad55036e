// ============================================================================
// Vehicle persistence & coordination engine
// ============================================================================

pub mod config;
pub mod coordination;
pub mod core;
pub mod engine;
pub mod materialize;
pub mod orphan;
pub mod propagation;
pub mod registry;
pub mod storage;
pub mod worker;

// Re-export main types for convenience
pub use config::{EngineConfig, OrphanAction, OrphanPolicy, WriteRetryPolicy};
pub use crate::core::{
    Condition, ConditionDelta, EntityId, EntityRecord, EntityStatus, EntitySummary,
    ExclusionClaim, LockClaim, OwnerId, PersistError, Result, Vec3, WorldHandle,
};
pub use engine::{Collaborators, EngineStats, PersistenceEngine};
pub use materialize::{ReplayLoader, ReplayReport, WorldMaterializer};
pub use orphan::{OrphanReport, OrphanSweeper, OwnedEntityMutator, OwnerActivity};
pub use propagation::{
    LiveFetch, LiveProperties, LivePropertySource, NullObserver, ObserverChannel, Projection,
};
pub use registry::{EntityRegistry, UpsertOutcome};
pub use storage::{DurableStore, FlushReport, JournalStore, MemoryStore, WriteThrough};
