use crate::core::{PersistError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the orphan sweep does with an abandoned vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanAction {
    #[default]
    Impound,
    Delete,
}

/// Orphan detection and disposition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanPolicy {
    pub enabled: bool,
    /// Minutes between sweeps.
    pub check_interval_mins: u64,
    /// Both the save and the owner's last activity must be older than this.
    pub threshold_days: u32,
    pub action: OrphanAction,
    pub fee_per_day: u64,
    pub max_fee: u64,
    /// Lot name handed to the ownership store when impounding.
    pub impound_lot: String,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_mins: 30,
            threshold_days: 7,
            action: OrphanAction::Impound,
            fee_per_day: 100,
            max_fee: 1_500,
            impound_lot: "impound".to_string(),
        }
    }
}

impl OrphanPolicy {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_mins.saturating_mul(60))
    }

    pub fn threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.threshold_days))
    }
}

/// Backoff settings for durable writes that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteRetryPolicy {
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Drain passes attempted at shutdown before giving up on pending writes.
    pub shutdown_attempts: u32,
}

impl Default for WriteRetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 50,
            max_backoff_ms: 30_000,
            shutdown_attempts: 3,
        }
    }
}

impl WriteRetryPolicy {
    /// Exponential backoff for the given (1-based) attempt, capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Engine configuration
///
/// Every field has a default, so a config file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parked (non-driven) vehicles an owner may have tracked at once.
    pub max_vehicles_per_player: usize,

    /// Delay between world spawns while replaying at startup.
    pub spawn_delay_ms: u64,

    /// Lifetime of a lock claim that is never released.
    pub lock_ttl_secs: u64,

    /// Period of the lock expiry sweep.
    pub lock_sweep_interval_secs: u64,

    /// Period of the write-through flush worker.
    pub write_flush_interval_ms: u64,

    /// Bound on one-shot live property requests.
    pub live_fetch_timeout_ms: u64,

    pub retry: WriteRetryPolicy,

    pub orphan: OrphanPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_vehicles_per_player: 5,
            spawn_delay_ms: 100,
            lock_ttl_secs: 300,
            lock_sweep_interval_secs: 60,
            write_flush_interval_ms: 100,
            live_fetch_timeout_ms: 2_000,
            retry: WriteRetryPolicy::default(),
            orphan: OrphanPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-owner capacity
    pub fn max_vehicles_per_player(mut self, max: usize) -> Self {
        self.max_vehicles_per_player = max;
        self
    }

    /// Set the delay between startup spawns
    pub fn spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay_ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    /// Set the lock TTL
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the lock sweep period
    pub fn lock_sweep_interval(mut self, interval: Duration) -> Self {
        self.lock_sweep_interval_secs = interval.as_secs();
        self
    }

    /// Set the write flush period
    pub fn write_flush_interval(mut self, interval: Duration) -> Self {
        self.write_flush_interval_ms = interval.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    /// Set the live property request timeout
    pub fn live_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.live_fetch_timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    pub fn retry(mut self, retry: WriteRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn orphan(mut self, orphan: OrphanPolicy) -> Self {
        self.orphan = orphan;
        self
    }

    pub fn lock_ttl_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_ttl_secs.min(i64::MAX as u64) as i64)
    }

    pub fn lock_sweep_period(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs)
    }

    pub fn spawn_delay_duration(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }

    pub fn write_flush_period(&self) -> Duration {
        Duration::from_millis(self.write_flush_interval_ms)
    }

    pub fn live_fetch_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.live_fetch_timeout_ms)
    }

    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PersistError::InvalidConfig(format!("read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            PersistError::InvalidConfig(format!("parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_vehicles_per_player == 0 {
            return Err(PersistError::InvalidConfig(
                "max_vehicles_per_player must be > 0".to_string(),
            ));
        }

        if self.lock_ttl_secs == 0 {
            return Err(PersistError::InvalidConfig("lock_ttl_secs must be > 0".to_string()));
        }

        if self.lock_sweep_interval_secs == 0 {
            return Err(PersistError::InvalidConfig(
                "lock_sweep_interval_secs must be > 0".to_string(),
            ));
        }

        if self.write_flush_interval_ms == 0 {
            return Err(PersistError::InvalidConfig(
                "write_flush_interval_ms must be > 0".to_string(),
            ));
        }

        if self.orphan.enabled && self.orphan.check_interval_mins == 0 {
            return Err(PersistError::InvalidConfig(
                "orphan.check_interval_mins must be > 0".to_string(),
            ));
        }

        if self.orphan.action == OrphanAction::Impound && self.orphan.impound_lot.trim().is_empty() {
            return Err(PersistError::InvalidConfig(
                "orphan.impound_lot cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
