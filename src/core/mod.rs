pub mod error;
pub mod types;

pub use error::{PersistError, Result};
pub use types::{
    Condition, ConditionDelta, EntityId, EntityRecord, EntityStatus, EntitySummary,
    ExclusionClaim, LockClaim, MAX_PLATE_LEN, OwnerId, Vec3, WorldHandle,
};
