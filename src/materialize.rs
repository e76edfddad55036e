//! Startup replay: turns loaded records back into world objects.

use crate::core::{EntityRecord, Result, WorldHandle};
use crate::propagation::Publisher;
use crate::registry::EntityRegistry;
use crate::worker::RunGuard;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, sleep};
use tracing::{Instrument, Level, event, info_span};

/// Host-side spawner for world objects.
#[async_trait]
pub trait WorldMaterializer: Send + Sync {
    async fn spawn(&self, record: &EntityRecord) -> Result<WorldHandle>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub spawned: usize,
    pub failed: usize,
    /// Records dropped from the registry before their turn came.
    pub skipped: usize,
}

pub struct ReplayLoader {
    materializer: Arc<dyn WorldMaterializer>,
    registry: Arc<EntityRegistry>,
    publisher: Arc<Publisher>,
    delay: Duration,
    in_flight: AtomicBool,
}

impl ReplayLoader {
    pub fn new(
        materializer: Arc<dyn WorldMaterializer>,
        registry: Arc<EntityRegistry>,
        publisher: Arc<Publisher>,
        delay: Duration,
    ) -> Self {
        Self {
            materializer,
            registry,
            publisher,
            delay,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Spawns records one at a time with `delay` between them. Only one
    /// replay may run at once.
    pub async fn replay(&self, records: Vec<EntityRecord>) -> Result<ReplayReport> {
        let _in_flight = RunGuard::acquire(&self.in_flight, "world replay")?;

        let span = info_span!("replay", total = records.len());
        Ok(self.run(records).instrument(span).await)
    }

    async fn run(&self, records: Vec<EntityRecord>) -> ReplayReport {
        let mut report = ReplayReport::default();
        let total = records.len();

        for (index, record) in records.into_iter().enumerate() {
            // The record may have been removed or re-saved since load.
            let Some(current) = self.registry.get(&record.id).await else {
                report.skipped += 1;
                continue;
            };

            match self.materializer.spawn(&current).await {
                Ok(handle) => {
                    self.publisher.bind(current.id.clone(), handle).await;
                    self.publisher.publish_tracked(&current).await;
                    report.spawned += 1;
                    event!(Level::DEBUG, entity_id = %current.id, handle = %handle, "entity materialized");
                }
                Err(err) => {
                    report.failed += 1;
                    event!(Level::WARN, entity_id = %current.id, error = %err, "failed to materialize entity");
                }
            }

            if index + 1 < total && !self.delay.is_zero() {
                sleep(self.delay).await;
            }
        }

        event!(
            Level::INFO,
            spawned = report.spawned,
            failed = report.failed,
            skipped = report.skipped,
            "world replay finished"
        );
        report
    }
}
