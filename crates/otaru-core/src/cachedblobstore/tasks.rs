use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};
use tracing::{debug, info, warn};

use otaru_storage::BlobStore;

use super::store::CachedBlobStore;
use crate::config::CacheConfig;
use crate::error::Result;

/// Shrinks the cache to the low watermark once it grows past the high one.
pub struct AutoReduceCacheTask {
    store: Arc<CachedBlobStore>,
    high_watermark: i64,
    low_watermark: i64,
}

impl AutoReduceCacheTask {
    pub fn new(store: Arc<CachedBlobStore>, high_watermark: i64, low_watermark: i64) -> Self {
        Self {
            store,
            high_watermark,
            low_watermark,
        }
    }

    pub fn run(&self) -> Result<()> {
        let size = self.store.total_size()?;
        if size <= self.high_watermark {
            debug!(size, high_watermark = self.high_watermark, "cache under high watermark");
            return Ok(());
        }
        self.store.reduce_cache(self.low_watermark, false)
    }
}

/// Persists the version cache of a store.
pub struct SaveStateTask {
    store: Arc<CachedBlobStore>,
}

impl SaveStateTask {
    pub fn new(store: Arc<CachedBlobStore>) -> Self {
        Self { store }
    }

    pub fn run(&self) -> Result<()> {
        self.store.save_state()
    }
}

/// Stops a periodic task thread when dropped.
pub struct PeriodicTaskHandle {
    name: &'static str,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicTaskHandle {
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(task = self.name, "periodic task thread panicked");
            }
        }
    }
}

impl Drop for PeriodicTaskHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run [`AutoReduceCacheTask`] every `auto_reduce_period`. Returns `None`
/// when the watermarks disable it.
pub fn spawn_auto_reduce(
    store: Arc<CachedBlobStore>,
    config: &CacheConfig,
) -> Result<Option<PeriodicTaskHandle>> {
    if !config.auto_reduce_enabled() {
        info!("automatic cache reduction disabled");
        return Ok(None);
    }
    let task = AutoReduceCacheTask::new(
        store,
        config.auto_reduce_high_watermark,
        config.auto_reduce_low_watermark,
    );
    info!(
        high_watermark = task.high_watermark,
        low_watermark = task.low_watermark,
        period_ms = config.auto_reduce_period_ms,
        "automatic cache reduction enabled"
    );
    spawn_periodic("auto-reduce", config.auto_reduce_period(), move || task.run()).map(Some)
}

/// Run [`SaveStateTask`] every `save_state_period`. Returns `None` for
/// read-only stores, stores without a snapshot cipher, or a zero period.
pub fn spawn_save_state(
    store: Arc<CachedBlobStore>,
    config: &CacheConfig,
) -> Result<Option<PeriodicTaskHandle>> {
    if !store.can_save_state() || !config.save_state_enabled() {
        info!("periodic version cache snapshots disabled");
        return Ok(None);
    }
    info!(
        period_ms = config.save_state_period_ms,
        "periodic version cache snapshots enabled"
    );
    let task = SaveStateTask::new(store);
    spawn_periodic("save-state", config.save_state_period(), move || task.run()).map(Some)
}

fn spawn_periodic<F>(name: &'static str, period: Duration, run: F) -> Result<PeriodicTaskHandle>
where
    F: Fn() -> Result<()> + Send + 'static,
{
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let thread = std::thread::Builder::new()
        .name(format!("otaru-{name}"))
        .spawn(move || loop {
            select! {
                recv(stop_rx) -> _ => break,
                default(period) => {
                    if let Err(e) = run() {
                        warn!(task = name, error = %e, "periodic task failed");
                    }
                }
            }
        })?;
    Ok(PeriodicTaskHandle {
        name,
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}
