use super::error::{PersistError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a normalized plate.
pub const MAX_PLATE_LEN: usize = 8;

/// Plate-like identity key of a tracked vehicle.
///
/// Normalized on construction: surrounding whitespace is trimmed and ASCII
/// letters are uppercased, so `" abc123 "` and `"ABC123"` address the same
/// entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(PersistError::Validation("plate is empty".to_string()));
        }
        if normalized.chars().count() > MAX_PLATE_LEN {
            return Err(PersistError::Validation(format!(
                "plate '{}' exceeds {} characters",
                normalized, MAX_PLATE_LEN
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = PersistError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Opaque owner identifier (license, citizen id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Fuel level, 0..=100.
    pub fuel: f32,
    pub body_health: f32,
    pub engine_health: f32,
}

impl Default for Condition {
    fn default() -> Self {
        Self {
            fuel: 100.0,
            body_health: 1000.0,
            engine_health: 1000.0,
        }
    }
}

impl Condition {
    pub(crate) fn normalized(mut self) -> Self {
        self.fuel = if self.fuel.is_finite() {
            self.fuel.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self
    }

    /// Applies an inbound damage report. Non-finite values are ignored.
    pub fn merge(&mut self, delta: &ConditionDelta) {
        if let Some(body) = delta.body_health.filter(|v| v.is_finite()) {
            self.body_health = body;
        }
        if let Some(engine) = delta.engine_health.filter(|v| v.is_finite()) {
            self.engine_health = engine;
        }
    }
}

/// Condition fields observers report back between full saves.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionDelta {
    pub body_health: Option<f32>,
    pub engine_health: Option<f32>,
}

/// Authoritative saved state of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub owner_id: OwnerId,
    /// Model identifier.
    pub kind: String,
    pub position: Vec3,
    pub heading: f32,
    /// Modification blob, stored byte-for-byte.
    #[serde(default)]
    pub configuration: Vec<u8>,
    #[serde(default)]
    pub condition: Condition,
    pub saved_at: DateTime<Utc>,
    /// Set while the owner occupies the vehicle. Never persisted as true.
    #[serde(skip)]
    pub being_used: bool,
}

impl EntityRecord {
    pub fn new(id: EntityId, owner_id: impl Into<OwnerId>, kind: impl Into<String>) -> Self {
        Self {
            id,
            owner_id: owner_id.into(),
            kind: kind.into(),
            position: Vec3::default(),
            heading: 0.0,
            configuration: Vec::new(),
            condition: Condition::default(),
            saved_at: DateTime::<Utc>::UNIX_EPOCH,
            being_used: false,
        }
    }

    pub fn at(mut self, position: Vec3, heading: f32) -> Self {
        self.position = position;
        self.heading = heading;
        self
    }

    pub fn with_configuration(mut self, configuration: Vec<u8>) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn in_use(mut self, being_used: bool) -> Self {
        self.being_used = being_used;
        self
    }

    pub fn saved_at(mut self, saved_at: DateTime<Utc>) -> Self {
        self.saved_at = saved_at;
        self
    }

    pub fn summary(&self) -> EntitySummary {
        EntitySummary {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl From<String> for OwnerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Permanent claim by a subsystem that takes the vehicle out of persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionClaim {
    pub claimant: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Temporary, advisory claim. Expires after the configured TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockClaim {
    pub claimant: String,
    pub locked_at: DateTime<Utc>,
}

impl LockClaim {
    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.locked_at > ttl
    }
}

/// Everything a collaborator needs to know before acting on an id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityStatus {
    pub tracked: bool,
    pub excluded: bool,
    pub locked: bool,
    pub exclusion: Option<ExclusionClaim>,
    pub lock: Option<LockClaim>,
    pub record: Option<EntityRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub id: EntityId,
    pub owner_id: OwnerId,
    pub kind: String,
}

/// Engine-side reference to the world object materialized for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldHandle(pub u64);

impl fmt::Display for WorldHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
