use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use otaru_crypto::Cipher;
use otaru_storage::{
    BlobHandle, BlobStore, BlobWriter, OffsetReader, OffsetWriter, RandomAccessBlobStore,
};
use otaru_types::flags::OpenFlags;

use super::entries_manager::EntriesManager;
use super::entry::CacheEntryInfo;
use super::handle::CachedBlobHandle;
use super::sync_worker::{SyncWorker, Syncer};
use super::usage_stats::{UsageStats, UsageStatsView};
use super::version_cache::{VersionCache, VersionCacheStats};
use super::{QueryVersion, StoreContext};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{OtaruError, Result};
use crate::scheduler::{Scheduler, TaskId};

#[derive(Debug, Clone, Serialize)]
pub struct CachedBlobStoreStats {
    pub flags: String,
    pub num_entries: usize,
    pub version_cache: VersionCacheStats,
    pub usage: UsageStatsView,
}

/// Configures and starts a [`CachedBlobStore`].
pub struct CachedBlobStoreBuilder {
    backend: Arc<dyn BlobStore>,
    cache: Arc<dyn RandomAccessBlobStore>,
    scheduler: Arc<dyn Scheduler>,
    query: Arc<dyn QueryVersion>,
    flags: OpenFlags,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    snapshot_cipher: Option<Arc<Cipher>>,
}

impl CachedBlobStoreBuilder {
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cipher for persisting the version cache to the backend. Without it
    /// the version cache lives in memory only.
    pub fn snapshot_cipher(mut self, cipher: Arc<Cipher>) -> Self {
        self.snapshot_cipher = Some(cipher);
        self
    }

    pub fn build(self) -> Result<CachedBlobStore> {
        CachedBlobStore::start(self)
    }
}

/// A [`RandomAccessBlobStore`] serving every blob from the local cache store
/// and writing changes back to the backend in the background.
pub struct CachedBlobStore {
    ctx: Arc<StoreContext>,
    flags: OpenFlags,
    usage: UsageStats,
    snapshot_cipher: Option<Arc<Cipher>>,
    sync_worker: Mutex<Option<SyncWorker>>,
    entries: Arc<EntriesManager>,
    quit: Mutex<bool>,
}

impl CachedBlobStore {
    pub fn builder(
        backend: Arc<dyn BlobStore>,
        cache: Arc<dyn RandomAccessBlobStore>,
        scheduler: Arc<dyn Scheduler>,
        query: Arc<dyn QueryVersion>,
    ) -> CachedBlobStoreBuilder {
        CachedBlobStoreBuilder {
            backend,
            cache,
            scheduler,
            query,
            flags: OpenFlags::RDWR_CREATE,
            config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
            snapshot_cipher: None,
        }
    }

    fn start(b: CachedBlobStoreBuilder) -> Result<Self> {
        b.config.validate()?;
        if b.flags.is_write_allowed() && !b.backend.flags().is_write_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "writable cached store requested, but backend {} is read-only",
                b.backend.impl_name()
            )));
        }
        if !b.cache.flags().is_write_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "cache store {} does not allow writes",
                b.cache.impl_name()
            )));
        }

        let version_cache = Arc::new(VersionCache::new(
            Arc::clone(&b.backend),
            Arc::clone(&b.query),
        ));
        if let Some(cipher) = &b.snapshot_cipher {
            match version_cache.restore_state(b.backend.as_ref(), cipher) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("no saved version cache"),
                Err(e) => warn!(error = %e, "failed to restore version cache, starting empty"),
            }
        }

        let usage = UsageStats::new(Arc::clone(&b.clock));
        match b.cache.list_blobs() {
            Ok(bps) => usage.import_blob_list(&bps),
            Err(OtaruError::Unsupported(_)) => {}
            Err(e) => return Err(e),
        }

        let writable = b.flags.is_write_allowed();
        let num_workers = b.config.num_sync_workers;
        let grace_period = b.config.sync_grace_period();
        let ctx = Arc::new(StoreContext {
            backend: b.backend,
            cache: b.cache,
            version_cache,
            query: b.query,
            scheduler: b.scheduler,
            clock: b.clock,
            config: b.config,
        });
        let entries = Arc::new(EntriesManager::new(Arc::clone(&ctx))?);
        let sync_worker = if writable {
            Some(SyncWorker::new(entries.clone(), num_workers, grace_period))
        } else {
            None
        };

        info!(
            backend = ctx.backend.impl_name(),
            cache = ctx.cache.impl_name(),
            flags = %b.flags,
            "cached blob store started"
        );
        Ok(Self {
            ctx,
            flags: b.flags,
            usage,
            snapshot_cipher: b.snapshot_cipher,
            sync_worker: Mutex::new(sync_worker),
            entries,
            quit: Mutex::new(false),
        })
    }

    pub fn entries_manager(&self) -> &EntriesManager {
        &self.entries
    }

    pub fn version_cache(&self) -> &VersionCache {
        &self.ctx.version_cache
    }

    /// True if the blob has a cache blob or a non-zero backend version.
    fn blob_exists(&self, blobpath: &str) -> Result<bool> {
        match self.ctx.cache.blob_size(blobpath) {
            Ok(_) => return Ok(true),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(self.ctx.version_cache.query(blobpath)? > 0)
    }

    /// Open a handle on `blobpath`. Without `CREATE`, a blob that exists in
    /// neither the cache nor the backend is `NotFound`.
    pub fn open_handle(&self, blobpath: &str, flags: OpenFlags) -> Result<CachedBlobHandle> {
        if flags.is_write_allowed() && !self.flags.is_write_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "write open of '{blobpath}' on read-only cached store"
            )));
        }
        if !flags.is_create_allowed() && !self.blob_exists(blobpath)? {
            return Err(OtaruError::NotFound(blobpath.to_string()));
        }

        self.usage.observe_open(blobpath, flags);
        self.entries.open_handle(blobpath, flags)
    }

    /// Remove the blob from the cache, the backend and all bookkeeping.
    pub fn remove_blob(&self, blobpath: &str) -> Result<()> {
        if !self.flags.is_write_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "remove of '{blobpath}' on read-only cached store"
            )));
        }
        self.entries.remove_blob(blobpath)?;
        self.ctx.version_cache.delete(blobpath);
        match self.ctx.backend.remove_blob(blobpath) {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        self.usage.observe_remove_blob(blobpath);
        match self.ctx.cache.remove_blob(blobpath) {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Drop least recently used cache blobs until the cache store holds at
    /// most `desired_size` bytes.
    pub fn reduce_cache(&self, desired_size: i64, dry_run: bool) -> Result<()> {
        let start = Instant::now();
        let size_before = self.ctx.cache.total_size()?;
        let mut needs_reduce = size_before - desired_size;
        if needs_reduce < 0 {
            info!(size = size_before, desired_size, "cache already under desired size");
            return Ok(());
        }
        info!(size = size_before, desired_size, needs_reduce, "reducing cache");

        for bp in self.usage.find_least_used() {
            let size = match self.ctx.cache.blob_size(&bp) {
                Ok(size) => size,
                Err(e) if e.is_not_found() => {
                    debug!(blobpath = %bp, "cache blob already gone");
                    continue;
                }
                Err(e) => return Err(e),
            };

            info!(blobpath = %bp, size, dry_run, "dropping cache entry");
            if !dry_run {
                if let Err(e) = self.entries.drop_cache_entry(&bp) {
                    warn!(blobpath = %bp, error = %e, "failed to drop cache entry");
                    continue;
                }
            }
            needs_reduce -= size;
            if needs_reduce < 0 {
                break;
            }
        }

        let size_after = self.ctx.cache.total_size()?;
        info!(
            size_before,
            size_after,
            dry_run,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "reduce cache done"
        );
        Ok(())
    }

    /// Run [`CachedBlobStore::reduce_cache`] on the scheduler.
    pub fn schedule_reduce_cache(self: &Arc<Self>, desired_size: i64, dry_run: bool) -> TaskId {
        let store = Arc::clone(self);
        self.ctx.scheduler.run_immediately(
            "reduce cache",
            Box::new(move |token| {
                token.check()?;
                store.reduce_cache(desired_size, dry_run)
            }),
        )
    }

    /// Flush every dirty entry to the backend.
    pub fn sync(&self) -> Result<()> {
        let syncers: Vec<Arc<dyn Syncer>> = self
            .entries
            .find_all_syncable()?
            .into_iter()
            .map(|e| e as Arc<dyn Syncer>)
            .collect();
        if syncers.is_empty() {
            return Ok(());
        }

        let errs = match self.sync_worker.lock().unwrap().as_ref() {
            Some(worker) => worker.sync_all(syncers),
            None => syncers.iter().filter_map(|s| s.sync().err()).collect(),
        };
        if errs.is_empty() {
            return Ok(());
        }
        let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
        Err(OtaruError::Other(format!(
            "failed to sync {} entries: {}",
            errs.len(),
            msgs.join("; ")
        )))
    }

    /// Sync the entry most overdue for it. Returns false if none was due.
    pub fn sync_one_entry(&self) -> Result<bool> {
        match self.entries.choose_sync_entry()? {
            Some(entry) => {
                entry.sync()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether [`CachedBlobStore::save_state`] can run: the store is
    /// writable and has a snapshot cipher.
    pub fn can_save_state(&self) -> bool {
        self.flags.is_write_allowed() && self.snapshot_cipher.is_some()
    }

    /// Persist the version cache to the backend.
    pub fn save_state(&self) -> Result<()> {
        let Some(cipher) = &self.snapshot_cipher else {
            return Err(OtaruError::Config(
                "no snapshot cipher configured for the cached store".into(),
            ));
        };
        self.ctx
            .version_cache
            .save_state(self.ctx.backend.as_ref(), cipher)
    }

    pub fn stats(&self) -> Result<CachedBlobStoreStats> {
        Ok(CachedBlobStoreStats {
            flags: self.flags.to_string(),
            num_entries: self.entries.num_entries()?,
            version_cache: self.ctx.version_cache.stats(),
            usage: self.usage.view(),
        })
    }

    pub fn dump_entries_info(&self) -> Result<Vec<CacheEntryInfo>> {
        self.entries.dump_entries_info()
    }

    /// Sync, stop the background workers, and persist the version cache.
    /// Calling it again is a no-op.
    pub fn quit(&self) {
        {
            let mut quit = self.quit.lock().unwrap();
            if *quit {
                return;
            }
            *quit = true;
        }

        if let Err(e) = self.sync() {
            warn!(error = %e, "final sync failed");
        }
        if let Some(mut worker) = self.sync_worker.lock().unwrap().take() {
            worker.quit();
        }
        if self.can_save_state() {
            if let Err(e) = self.save_state() {
                warn!(error = %e, "failed to save version cache");
            }
        }
        self.entries.quit();
        info!("cached blob store stopped");
    }
}

impl Drop for CachedBlobStore {
    fn drop(&mut self) {
        self.quit();
    }
}

impl BlobStore for CachedBlobStore {
    fn open_reader(&self, blobpath: &str) -> Result<Box<dyn Read + Send>> {
        let handle = self.open_handle(blobpath, OpenFlags::RDONLY)?;
        Ok(Box::new(OffsetReader::new(handle, 0)))
    }

    /// The writer replaces the blob content from offset 0.
    fn open_writer(&self, blobpath: &str) -> Result<Box<dyn BlobWriter>> {
        let mut handle = self.open_handle(blobpath, OpenFlags::WRONLY | OpenFlags::CREATE)?;
        handle.truncate(0)?;
        Ok(Box::new(CachedBlobWriter {
            inner: OffsetWriter::new(handle, 0),
        }))
    }

    fn impl_name(&self) -> &'static str {
        "CachedBlobStore"
    }

    fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn blob_size(&self, blobpath: &str) -> Result<i64> {
        self.open_handle(blobpath, OpenFlags::RDONLY)?.size()
    }

    /// Active cache entries followed by the backend's blobs.
    fn list_blobs(&self) -> Result<Vec<String>> {
        let mut list = self.entries.list_blobs()?;
        let backend = self.ctx.backend.list_blobs()?;
        let mut seen: HashSet<String> = list.iter().cloned().collect();
        list.extend(backend.into_iter().filter(|bp| seen.insert(bp.clone())));
        Ok(list)
    }

    fn remove_blob(&self, blobpath: &str) -> Result<()> {
        CachedBlobStore::remove_blob(self, blobpath)
    }

    fn total_size(&self) -> Result<i64> {
        self.ctx.cache.total_size()
    }
}

impl RandomAccessBlobStore for CachedBlobStore {
    fn open(&self, blobpath: &str, flags: OpenFlags) -> Result<Box<dyn BlobHandle>> {
        Ok(Box::new(self.open_handle(blobpath, flags)?))
    }
}

struct CachedBlobWriter {
    inner: OffsetWriter<CachedBlobHandle>,
}

impl Write for CachedBlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl BlobWriter for CachedBlobWriter {
    fn close(self: Box<Self>) -> Result<()> {
        self.inner.into_inner().close()
    }
}
