use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use otaru_storage::{BlobHandle, CancelToken, CancellableReader, OffsetReader};
use otaru_types::flags::OpenFlags;
use otaru_types::BlobVersion;

use super::handle::CachedBlobHandle;
use super::sync_worker::Syncer;
use super::StoreContext;
use crate::clock::NEVER;
use crate::error::{OtaruError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheEntryState {
    Uninitialized,
    /// The cache blob is being filled from the backend.
    Invalidating,
    InvalidateFailed,
    Clean,
    /// The cache blob holds changes the backend has not seen yet.
    Dirty,
    Closed,
}

impl CacheEntryState {
    /// Whether the entry accepts I/O and should be listed.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CacheEntryState::Invalidating | CacheEntryState::Clean | CacheEntryState::Dirty
        )
    }

    pub fn needs_sync(self) -> bool {
        self == CacheEntryState::Dirty
    }
}

impl fmt::Display for CacheEntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Point-in-time view of an entry, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub blobpath: String,
    pub state: CacheEntryState,
    pub blob_len: i64,
    pub valid_len: i64,
    pub sync_count: u64,
    pub last_used: DateTime<Utc>,
    pub last_write: DateTime<Utc>,
    pub last_sync: DateTime<Utc>,
    pub number_of_writer_handles: usize,
    pub number_of_handles: usize,
}

struct EntryInner {
    state: CacheEntryState,
    cache_handle: Option<Box<dyn BlobHandle>>,
    /// Logical length of the blob.
    blob_len: i64,
    /// Prefix of the cache blob that holds valid data.
    valid_len: i64,
    sync_count: u64,
    last_used: DateTime<Utc>,
    last_write: DateTime<Utc>,
    last_sync: DateTime<Utc>,
    handles: HashMap<u64, OpenFlags>,
    /// Opens reserved by the entries manager that have not registered a handle yet.
    pending_opens: usize,
    next_handle_id: u64,
    invalidate_token: Option<CancelToken>,
}

impl EntryInner {
    fn is_busy(&self) -> bool {
        !self.handles.is_empty() || self.pending_opens > 0
    }

    fn cache_handle(&mut self, blobpath: &str) -> Result<&mut Box<dyn BlobHandle>> {
        self.cache_handle
            .as_mut()
            .ok_or_else(|| OtaruError::InvalidState(format!("cache blob '{blobpath}' is not open")))
    }
}

/// The cached state of one blob.
///
/// All I/O on the entry is serialized by its mutex. `progress` is notified
/// whenever invalidation advances or the state changes, so readers can wait
/// for the region they need.
pub struct CacheEntry {
    blobpath: String,
    ctx: Arc<StoreContext>,
    inner: Mutex<EntryInner>,
    progress: Condvar,
}

impl CacheEntry {
    pub(crate) fn new(blobpath: &str, ctx: Arc<StoreContext>) -> Self {
        Self {
            blobpath: blobpath.to_string(),
            ctx,
            inner: Mutex::new(EntryInner {
                state: CacheEntryState::Uninitialized,
                cache_handle: None,
                blob_len: -1,
                valid_len: 0,
                sync_count: 0,
                last_used: NEVER,
                last_write: NEVER,
                last_sync: NEVER,
                handles: HashMap::new(),
                pending_opens: 0,
                next_handle_id: 1,
                invalidate_token: None,
            }),
            progress: Condvar::new(),
        }
    }

    pub fn blobpath(&self) -> &str {
        &self.blobpath
    }

    pub fn state(&self) -> CacheEntryState {
        self.inner.lock().unwrap().state
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().last_used
    }

    pub fn num_handles(&self) -> usize {
        self.inner.lock().unwrap().handles.len()
    }

    /// Whether the entry has open handles or an open in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().is_busy()
    }

    /// Pin the entry against eviction until the matching
    /// [`CacheEntry::open_reserved_handle`] call.
    pub(crate) fn reserve(&self) {
        self.inner.lock().unwrap().pending_opens += 1;
    }

    /// `(state, last_write, last_sync)` read under one lock.
    pub(crate) fn sync_status(&self) -> (CacheEntryState, DateTime<Utc>, DateTime<Utc>) {
        let inner = self.inner.lock().unwrap();
        (inner.state, inner.last_write, inner.last_sync)
    }

    pub(crate) fn touch(&self) {
        let now = self.ctx.clock.now();
        self.inner.lock().unwrap().last_used = now;
    }

    fn set_state(&self, inner: &mut EntryInner, state: CacheEntryState) {
        if inner.state != state {
            debug!(blobpath = %self.blobpath, from = %inner.state, to = %state, "cache entry state");
            inner.state = state;
        }
    }

    /// Register a new handle, initializing the entry on first use.
    pub(crate) fn open_handle(self: &Arc<Self>, flags: OpenFlags) -> Result<CachedBlobHandle> {
        let inner = self.inner.lock().unwrap();
        self.open_handle_locked(inner, flags)
    }

    /// Like [`CacheEntry::open_handle`], releasing a reservation taken by
    /// [`CacheEntry::reserve`] whether or not the open succeeds.
    pub(crate) fn open_reserved_handle(self: &Arc<Self>, flags: OpenFlags) -> Result<CachedBlobHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_opens = inner.pending_opens.saturating_sub(1);
        self.open_handle_locked(inner, flags)
    }

    fn open_handle_locked(
        self: &Arc<Self>,
        mut inner: MutexGuard<'_, EntryInner>,
        flags: OpenFlags,
    ) -> Result<CachedBlobHandle> {
        let mut invalidate = None;
        match inner.state {
            CacheEntryState::Uninitialized
            | CacheEntryState::Closed
            | CacheEntryState::InvalidateFailed => {
                if let Some(mut stale) = inner.cache_handle.take() {
                    if let Err(e) = stale.close() {
                        warn!(blobpath = %self.blobpath, error = %e, "failed to close stale cache handle");
                    }
                }
                invalidate = self.initialize(&mut inner)?;
            }
            CacheEntryState::Invalidating | CacheEntryState::Clean | CacheEntryState::Dirty => {}
        }

        inner.last_used = self.ctx.clock.now();
        let id = inner.next_handle_id;
        inner.next_handle_id += 1;
        inner.handles.insert(id, flags);
        drop(inner);

        if let Some(token) = invalidate {
            self.schedule_invalidate(token);
        }
        Ok(CachedBlobHandle::new(Arc::clone(self), id, flags))
    }

    pub(crate) fn close_handle(&self, id: u64) {
        self.inner.lock().unwrap().handles.remove(&id);
    }

    /// Compare the cached and backend versions and choose the initial state.
    /// Returns the cancel token of the invalidation to start, if any.
    fn initialize(&self, inner: &mut EntryInner) -> Result<Option<CancelToken>> {
        let mut handle = self.ctx.cache.open(&self.blobpath, OpenFlags::RDWR_CREATE)?;
        let cachever = self.query_cache_version(&mut handle)?;
        let backendver = self.ctx.version_cache.query(&self.blobpath)?;

        let mut token = None;
        if cachever > backendver {
            warn!(
                blobpath = %self.blobpath,
                cache_version = cachever,
                backend_version = backendver,
                "cache is newer than backend on open, previous sync did not finish?"
            );
            let size = handle.size()?;
            inner.blob_len = size;
            inner.valid_len = size;
            self.set_state(inner, CacheEntryState::Dirty);
        } else if cachever == backendver {
            let size = handle.size()?;
            inner.blob_len = size;
            inner.valid_len = size;
            self.set_state(inner, CacheEntryState::Clean);
        } else {
            let len = self.ctx.backend.blob_size(&self.blobpath)?;
            handle.truncate(0)?;
            inner.blob_len = len;
            inner.valid_len = 0;
            if len == 0 {
                self.set_state(inner, CacheEntryState::Clean);
            } else {
                debug!(
                    blobpath = %self.blobpath,
                    cache_version = cachever,
                    backend_version = backendver,
                    blob_len = len,
                    "cache is stale, invalidating"
                );
                let t = CancelToken::new();
                inner.invalidate_token = Some(t.clone());
                token = Some(t);
                self.set_state(inner, CacheEntryState::Invalidating);
            }
        }
        inner.cache_handle = Some(handle);
        Ok(token)
    }

    fn query_cache_version(&self, handle: &mut Box<dyn BlobHandle>) -> Result<BlobVersion> {
        self.ctx
            .query
            .query_version(&mut OffsetReader::new(handle, 0))
    }

    fn schedule_invalidate(self: &Arc<Self>, token: CancelToken) {
        let entry = Arc::clone(self);
        self.ctx.scheduler.run_immediately(
            "invalidate cache",
            Box::new(move |sched_token| entry.invalidate(sched_token, token)),
        );
    }

    /// Copy the backend blob into the cache blob.
    fn invalidate(&self, sched_token: &CancelToken, token: CancelToken) -> Result<()> {
        let start = Instant::now();
        match self.invalidate_inner(sched_token, token) {
            Ok(()) => {
                info!(
                    blobpath = %self.blobpath,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "cache invalidation finished"
                );
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.state == CacheEntryState::Invalidating {
                    inner.valid_len = 0;
                    self.set_state(&mut inner, CacheEntryState::InvalidateFailed);
                }
                inner.invalidate_token = None;
                self.progress.notify_all();
                if !matches!(e, OtaruError::Cancelled) {
                    warn!(blobpath = %self.blobpath, error = %e, "cache invalidation failed");
                }
                Err(e)
            }
        }
    }

    fn invalidate_inner(&self, sched_token: &CancelToken, token: CancelToken) -> Result<()> {
        let backend = self.ctx.backend.open_reader(&self.blobpath)?;
        let mut r = CancellableReader::new(backend, token);
        let mut buf = vec![0u8; self.ctx.config.invalidate_block_size];
        loop {
            sched_token.check()?;
            let n = match r.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(OtaruError::from_io(e)),
            };

            let mut inner = self.inner.lock().unwrap();
            if inner.state != CacheEntryState::Invalidating {
                debug!(blobpath = %self.blobpath, state = %inner.state, "invalidation superseded");
                return Ok(());
            }
            if n == 0 {
                return Err(OtaruError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "backend blob '{}' ended at {} of {} bytes",
                        self.blobpath, inner.valid_len, inner.blob_len
                    ),
                )));
            }
            if inner.valid_len + n as i64 > inner.blob_len {
                return Err(OtaruError::InvalidState(format!(
                    "backend blob '{}' is longer than {} bytes",
                    self.blobpath, inner.blob_len
                )));
            }

            let offset = inner.valid_len;
            inner.cache_handle(&self.blobpath)?.pwrite(&buf[..n], offset)?;
            inner.valid_len += n as i64;
            if inner.valid_len == inner.blob_len {
                inner.invalidate_token = None;
                self.set_state(&mut inner, CacheEntryState::Clean);
                self.progress.notify_all();
                return Ok(());
            }
            self.progress.notify_all();
        }
    }

    /// Wait until `[0, required)` is valid. Pass `i64::MAX` to wait for
    /// invalidation to finish.
    fn wait_until_valid<'a>(
        &self,
        mut inner: MutexGuard<'a, EntryInner>,
        required: i64,
    ) -> Result<MutexGuard<'a, EntryInner>> {
        loop {
            match inner.state {
                CacheEntryState::Clean | CacheEntryState::Dirty => return Ok(inner),
                CacheEntryState::Invalidating => {
                    if inner.valid_len >= required {
                        return Ok(inner);
                    }
                    debug!(
                        blobpath = %self.blobpath,
                        required,
                        valid_len = inner.valid_len,
                        "waiting for cache fill"
                    );
                    inner = self.progress.wait(inner).unwrap();
                }
                CacheEntryState::InvalidateFailed => {
                    return Err(OtaruError::InvalidateFailed(self.blobpath.clone()))
                }
                state @ (CacheEntryState::Uninitialized | CacheEntryState::Closed) => {
                    return Err(OtaruError::InvalidState(format!(
                        "cache entry '{}' is {state}",
                        self.blobpath
                    )))
                }
            }
        }
    }

    fn mark_dirty(&self, inner: &mut EntryInner) {
        let now = self.ctx.clock.now();
        inner.last_used = now;
        inner.last_write = now;
        if inner.last_sync == NEVER {
            inner.last_sync = now;
        }
        self.set_state(inner, CacheEntryState::Dirty);
        self.progress.notify_all();
    }

    pub fn pread(&self, buf: &mut [u8], offset: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.last_used = self.ctx.clock.now();
        let required = (offset + buf.len() as i64).min(inner.blob_len);
        let mut inner = self.wait_until_valid(inner, required)?;
        inner.cache_handle(&self.blobpath)?.pread(buf, offset)
    }

    pub fn pwrite(&self, buf: &[u8], offset: i64) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut inner = self.wait_until_valid(inner, i64::MAX)?;
        if buf.is_empty() {
            return Ok(());
        }
        inner.cache_handle(&self.blobpath)?.pwrite(buf, offset)?;
        let right = offset + buf.len() as i64;
        if right > inner.blob_len {
            inner.blob_len = right;
            inner.valid_len = right;
        }
        self.mark_dirty(&mut inner);
        Ok(())
    }

    pub fn truncate(&self, size: i64) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut inner = self.wait_until_valid(inner, i64::MAX)?;
        if inner.blob_len == size {
            return Ok(());
        }
        inner.cache_handle(&self.blobpath)?.truncate(size)?;
        inner.blob_len = size;
        inner.valid_len = size;
        self.mark_dirty(&mut inner);
        Ok(())
    }

    pub fn size(&self) -> i64 {
        self.inner.lock().unwrap().blob_len
    }

    /// Upload the cache blob to the backend if its version is ahead.
    fn writeback_locked(&self, inner: &mut EntryInner) -> Result<()> {
        if inner.state != CacheEntryState::Dirty {
            return Ok(());
        }
        let blob_len = inner.blob_len;
        let handle = inner.cache_handle(&self.blobpath)?;
        let cachever = self.query_cache_version(handle)?;
        let backendver = self.ctx.version_cache.query(&self.blobpath)?;
        if backendver == cachever {
            debug!(
                blobpath = %self.blobpath,
                version = cachever,
                "writes did not bump the version, skipping writeback"
            );
            self.set_state(inner, CacheEntryState::Clean);
            return Ok(());
        }
        if backendver > cachever {
            return Err(OtaruError::InvalidState(format!(
                "backend version {backendver} of '{}' is newer than cached version {cachever}",
                self.blobpath
            )));
        }

        info!(
            blobpath = %self.blobpath,
            cache_version = cachever,
            backend_version = backendver,
            "writing back cache blob"
        );
        let mut w = self.ctx.backend.open_writer(&self.blobpath)?;
        let mut r = OffsetReader::new(&mut *handle, 0).take(blob_len.max(0) as u64);
        io::copy(&mut r, &mut w).map_err(OtaruError::from_io)?;
        w.close()?;

        self.ctx.version_cache.set(&self.blobpath, cachever);
        self.set_state(inner, CacheEntryState::Clean);
        self.progress.notify_all();
        Ok(())
    }

    /// Flush dirty content to the backend and the cache store.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        while inner.state == CacheEntryState::Invalidating {
            inner = self.progress.wait(inner).unwrap();
        }
        match inner.state {
            CacheEntryState::Clean => return Ok(()),
            CacheEntryState::Dirty => {}
            state => {
                warn!(blobpath = %self.blobpath, %state, "sync requested on inactive entry");
                return Ok(());
            }
        }

        let start = Instant::now();
        if let Err(e) = self.writeback_locked(&mut inner) {
            warn!(blobpath = %self.blobpath, error = %e, "writeback failed");
            return Err(e);
        }
        inner.cache_handle(&self.blobpath)?.sync()?;
        inner.sync_count += 1;
        inner.last_sync = self.ctx.clock.now();
        info!(
            blobpath = %self.blobpath,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "synced cache entry"
        );
        Ok(())
    }

    /// Close the entry. Unless `abandon` is set, dirty content is written
    /// back first. Fails while handles remain open or an open is in flight.
    pub fn close(&self, abandon: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_busy() {
            return Err(OtaruError::InvalidState(format!(
                "cache entry '{}' has {} open handles and {} pending opens",
                self.blobpath,
                inner.handles.len(),
                inner.pending_opens
            )));
        }
        if matches!(
            inner.state,
            CacheEntryState::Uninitialized | CacheEntryState::Closed
        ) {
            return Ok(());
        }

        if abandon {
            if let Some(token) = inner.invalidate_token.take() {
                debug!(blobpath = %self.blobpath, "cancelling invalidation");
                token.cancel();
            }
        } else {
            while inner.state == CacheEntryState::Invalidating {
                inner = self.progress.wait(inner).unwrap();
            }
            if inner.state == CacheEntryState::Dirty {
                self.writeback_locked(&mut inner)?;
                inner.sync_count += 1;
                inner.last_sync = self.ctx.clock.now();
            }
        }

        debug!(blobpath = %self.blobpath, state = %inner.state, abandon, "closing cache entry");
        if let Some(mut handle) = inner.cache_handle.take() {
            handle.close()?;
        }
        self.set_state(&mut inner, CacheEntryState::Closed);
        self.progress.notify_all();
        Ok(())
    }

    pub fn info(&self) -> CacheEntryInfo {
        let inner = self.inner.lock().unwrap();
        CacheEntryInfo {
            blobpath: self.blobpath.clone(),
            state: inner.state,
            blob_len: inner.blob_len,
            valid_len: inner.valid_len,
            sync_count: inner.sync_count,
            last_used: inner.last_used,
            last_write: inner.last_write,
            last_sync: inner.last_sync,
            number_of_writer_handles: inner
                .handles
                .values()
                .filter(|f| f.is_write_allowed())
                .count(),
            number_of_handles: inner.handles.len(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_state_for_test(
        &self,
        state: CacheEntryState,
        last_write: DateTime<Utc>,
        last_sync: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        inner.last_write = last_write;
        inner.last_sync = last_sync;
    }
}

impl Syncer for CacheEntry {
    fn sync(&self) -> Result<()> {
        CacheEntry::sync(self)
    }

    fn name(&self) -> &str {
        &self.blobpath
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("blobpath", &self.blobpath)
            .field("state", &self.state())
            .finish()
    }
}
