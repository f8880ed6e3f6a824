//! A write-back cache in front of a remote blob store.
//!
//! Each blob that is opened through [`CachedBlobStore`] gets a [`CacheEntry`]
//! that mirrors the remote blob into the local cache store and tracks whether
//! the local copy is clean, dirty or still being filled. Dirty entries are
//! flushed to the backend by the [`SyncWorker`] pool.

mod entries_manager;
mod entry;
mod handle;
mod store;
mod sync_worker;
mod tasks;
mod usage_stats;
mod version_cache;

use std::io::Read;
use std::sync::Arc;

use otaru_storage::{BlobStore, RandomAccessBlobStore};
use otaru_types::BlobVersion;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::scheduler::Scheduler;

pub use entries_manager::EntriesManager;
pub use entry::{CacheEntry, CacheEntryInfo, CacheEntryState};
pub use handle::CachedBlobHandle;
pub use store::{CachedBlobStore, CachedBlobStoreBuilder, CachedBlobStoreStats};
pub use sync_worker::{SyncCandidatesProvider, SyncWorker, Syncer};
pub use tasks::{
    spawn_auto_reduce, spawn_save_state, AutoReduceCacheTask, PeriodicTaskHandle, SaveStateTask,
};
pub use usage_stats::{UsageStats, UsageStatsView};
pub use version_cache::{VersionCache, VersionCacheStats};

/// Reads the payload version out of a blob's leading bytes.
///
/// An empty stream is version 0.
pub trait QueryVersion: Send + Sync {
    fn query_version(&self, r: &mut dyn Read) -> Result<BlobVersion>;
}

impl<F> QueryVersion for F
where
    F: Fn(&mut dyn Read) -> Result<BlobVersion> + Send + Sync,
{
    fn query_version(&self, r: &mut dyn Read) -> Result<BlobVersion> {
        self(r)
    }
}

/// Collaborators shared by every entry of one store.
pub(crate) struct StoreContext {
    pub backend: Arc<dyn BlobStore>,
    pub cache: Arc<dyn RandomAccessBlobStore>,
    pub version_cache: Arc<VersionCache>,
    pub query: Arc<dyn QueryVersion>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub config: CacheConfig,
}
