use crate::core::{PersistError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{Level, event};

/// Background task running a tick on a fixed period until stopped.
pub struct PeriodicWorker {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl PeriodicWorker {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the worker to stop and waits for the current tick to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| PersistError::Worker(format!("{} join: {}", self.name, err)))?;
        }

        event!(Level::DEBUG, worker = self.name, "worker stopped");
        Ok(())
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns `tick` every `period`. The first tick fires one period after
/// spawning; ticks never overlap and missed ones are not replayed.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> PeriodicWorker
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let period = period.max(Duration::from_millis(10));

    let join_handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = ticker.tick() => {
                    tick().await;
                }
            }
        }
    });

    event!(Level::DEBUG, worker = name, period_ms = period.as_millis() as u64, "worker started");
    PeriodicWorker {
        name,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

/// Marks a single-flight job as running for as long as it is held. The flag
/// is cleared on drop, so a cancelled job does not wedge the next run.
pub(crate) struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool, job: &str) -> Result<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(PersistError::AlreadyRunning(format!("{} already in progress", job)));
        }
        Ok(Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
