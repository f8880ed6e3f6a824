use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{debug, info, warn};

use otaru_types::flags::OpenFlags;

use super::entry::{CacheEntry, CacheEntryInfo};
use super::handle::CachedBlobHandle;
use super::sync_worker::{SyncCandidatesProvider, Syncer};
use super::StoreContext;
use crate::clock::is_older_than;
use crate::error::{OtaruError, Result};

type Request = Box<dyn FnOnce(&mut ManagerState) + Send>;

enum Msg {
    Run(Request),
    Quit,
}

struct ManagerState {
    ctx: Arc<StoreContext>,
    entries: HashMap<String, Arc<CacheEntry>>,
}

/// Owner of the `blobpath -> CacheEntry` map.
///
/// Every operation is executed in order on a dedicated thread, so the map
/// needs no lock of its own.
pub struct EntriesManager {
    req_tx: Sender<Msg>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EntriesManager {
    pub(crate) fn new(ctx: Arc<StoreContext>) -> Result<Self> {
        let (req_tx, req_rx) = unbounded::<Msg>();
        let thread = std::thread::Builder::new()
            .name("otaru-entries".into())
            .spawn(move || {
                let mut st = ManagerState {
                    ctx,
                    entries: HashMap::new(),
                };
                for msg in req_rx.iter() {
                    match msg {
                        Msg::Run(f) => f(&mut st),
                        Msg::Quit => break,
                    }
                }
                debug!(entries = st.entries.len(), "entries manager stopped");
            })?;
        Ok(Self {
            req_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ManagerState) -> R + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.req_tx
            .send(Msg::Run(Box::new(move |st| {
                let _ = tx.send(f(st));
            })))
            .map_err(|_| stopped())?;
        rx.recv().map_err(|_| stopped())
    }

    /// The entry for `blobpath`, registering a new one if needed. Idle
    /// entries are evicted first when the map is over capacity.
    pub fn open_entry(&self, blobpath: &str) -> Result<Arc<CacheEntry>> {
        let blobpath = blobpath.to_string();
        self.call(move |st| st.open_entry(&blobpath))?
    }

    /// Like [`EntriesManager::open_entry`], but the entry is reserved before
    /// it leaves the manager thread so eviction cannot detach it. The caller
    /// must follow up with [`CacheEntry::open_reserved_handle`].
    pub(crate) fn reserve_entry(&self, blobpath: &str) -> Result<Arc<CacheEntry>> {
        let blobpath = blobpath.to_string();
        self.call(move |st| {
            let entry = st.open_entry(&blobpath)?;
            entry.reserve();
            Ok(entry)
        })?
    }

    /// Open a handle on the entry for `blobpath`, registering it if needed.
    pub fn open_handle(&self, blobpath: &str, flags: OpenFlags) -> Result<CachedBlobHandle> {
        self.reserve_entry(blobpath)?.open_reserved_handle(flags)
    }

    /// Abandon and forget the entry for `blobpath`, if any.
    pub fn remove_blob(&self, blobpath: &str) -> Result<()> {
        let blobpath = blobpath.to_string();
        self.call(move |st| {
            let Some(entry) = st.entries.get(&blobpath) else {
                return Ok(());
            };
            entry.close(true)?;
            st.entries.remove(&blobpath);
            Ok(())
        })?
    }

    /// Write back and forget the entry for `blobpath`, then delete its
    /// cache blob.
    pub fn drop_cache_entry(&self, blobpath: &str) -> Result<()> {
        let blobpath = blobpath.to_string();
        self.call(move |st| {
            if let Some(entry) = st.entries.get(&blobpath) {
                entry.close(false)?;
                st.entries.remove(&blobpath);
            }
            match st.ctx.cache.remove_blob(&blobpath) {
                Err(e) if !e.is_not_found() => Err(e),
                _ => Ok(()),
            }
        })?
    }

    /// Paths of entries currently accepting I/O.
    pub fn list_blobs(&self) -> Result<Vec<String>> {
        self.call(|st| {
            st.entries
                .values()
                .filter(|e| e.state().is_active())
                .map(|e| e.blobpath().to_string())
                .collect()
        })
    }

    pub fn dump_entries_info(&self) -> Result<Vec<CacheEntryInfo>> {
        self.call(|st| st.entries.values().map(|e| e.info()).collect())
    }

    pub fn num_entries(&self) -> Result<usize> {
        self.call(|st| st.entries.len())
    }

    /// Up to `limit` dirty entries due for a sync: those not synced within
    /// the sync timeout (oldest sync first), then those not written within
    /// the write timeout (oldest write first).
    pub fn find_sync_candidates(&self, limit: usize) -> Result<Vec<Arc<CacheEntry>>> {
        self.call(move |st| st.find_sync_candidates(limit))
    }

    /// Every entry with unsynced changes.
    pub fn find_all_syncable(&self) -> Result<Vec<Arc<CacheEntry>>> {
        self.call(|st| {
            st.entries
                .values()
                .filter(|e| e.state().needs_sync())
                .cloned()
                .collect()
        })
    }

    /// The single entry most in need of a sync, if any is overdue.
    pub fn choose_sync_entry(&self) -> Result<Option<Arc<CacheEntry>>> {
        self.call(|st| st.choose_sync_entry())
    }

    /// Sync every entry in turn on the manager thread.
    pub fn sync_all(&self) -> Result<()> {
        let errs = self.call(|st| {
            st.entries
                .values()
                .filter_map(|e| {
                    e.sync()
                        .err()
                        .map(|err| format!("'{}': {err}", e.blobpath()))
                })
                .collect::<Vec<_>>()
        })?;
        if errs.is_empty() {
            return Ok(());
        }
        Err(OtaruError::Other(format!(
            "failed to sync {} entries: {}",
            errs.len(),
            errs.join("; ")
        )))
    }

    /// Stop the manager thread. Later calls fail.
    pub fn quit(&self) {
        let Some(thread) = self.thread.lock().unwrap().take() else {
            return;
        };
        let _ = self.req_tx.send(Msg::Quit);
        if thread.join().is_err() {
            warn!("entries manager thread panicked");
        }
    }
}

impl Drop for EntriesManager {
    fn drop(&mut self) {
        self.quit();
    }
}

impl SyncCandidatesProvider for EntriesManager {
    fn find_sync_candidates(&self, limit: usize) -> Vec<Arc<dyn Syncer>> {
        match EntriesManager::find_sync_candidates(self, limit) {
            Ok(entries) => entries
                .into_iter()
                .map(|e| e as Arc<dyn Syncer>)
                .collect(),
            Err(e) => {
                debug!(error = %e, "no sync candidates");
                Vec::new()
            }
        }
    }
}

fn by_age(a: &(DateTime<Utc>, &Arc<CacheEntry>), b: &(DateTime<Utc>, &Arc<CacheEntry>)) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| a.1.blobpath().cmp(b.1.blobpath()))
}

fn stopped() -> OtaruError {
    OtaruError::InvalidState("entries manager has stopped".into())
}

impl ManagerState {
    fn open_entry(&mut self, blobpath: &str) -> Result<Arc<CacheEntry>> {
        if let Some(entry) = self.entries.get(blobpath) {
            entry.touch();
            return Ok(Arc::clone(entry));
        }

        self.close_old_entries_if_needed()?;

        let entry = Arc::new(CacheEntry::new(blobpath, Arc::clone(&self.ctx)));
        entry.touch();
        self.entries
            .insert(blobpath.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    fn try_close_entry(&mut self, entry: &CacheEntry) -> bool {
        if let Err(e) = entry.close(false) {
            warn!(blobpath = %entry.blobpath(), error = %e, "failed to close cache entry for eviction");
            return false;
        }
        info!(blobpath = %entry.blobpath(), "evicted cache entry");
        self.entries.remove(entry.blobpath());
        true
    }

    /// Evict idle entries until the map is back within `max_entries`:
    /// first those unused for the inactive timeout, oldest first, then the
    /// single least recently used idle entry.
    fn close_old_entries_if_needed(&mut self) -> Result<()> {
        let max = self.ctx.config.max_entries;
        if self.entries.len() <= max {
            return Ok(());
        }

        let now = self.ctx.clock.now();
        let timeout = self.ctx.config.inactive_close_timeout();
        let mut idle: Vec<(DateTime<Utc>, Arc<CacheEntry>)> = self
            .entries
            .values()
            .filter(|e| !e.is_busy())
            .map(|e| (e.last_used(), Arc::clone(e)))
            .collect();
        idle.sort_by(|a, b| by_age(&(a.0, &a.1), &(b.0, &b.1)));

        let mut rest = Vec::new();
        for (last_used, entry) in idle {
            if self.entries.len() <= max {
                break;
            }
            if !is_older_than(last_used, now, timeout) || !self.try_close_entry(&entry) {
                rest.push(entry);
            }
        }

        if self.entries.len() > max {
            if let Some(oldest) = rest.first() {
                self.try_close_entry(oldest);
            }
        }

        if self.entries.len() > max {
            warn!(entries = self.entries.len(), max, "cannot evict enough cache entries");
            return Err(OtaruError::TooManyOpenFiles);
        }
        Ok(())
    }

    fn find_sync_candidates(&self, limit: usize) -> Vec<Arc<CacheEntry>> {
        let now = self.ctx.clock.now();
        let sync_timeout = self.ctx.config.sync_timeout();
        let write_timeout = self.ctx.config.write_timeout();

        let mut sync_overdue = Vec::new();
        let mut write_overdue = Vec::new();
        for entry in self.entries.values() {
            let (state, last_write, last_sync) = entry.sync_status();
            if !state.needs_sync() {
                continue;
            }
            if is_older_than(last_sync, now, sync_timeout) {
                sync_overdue.push((last_sync, entry));
            }
            if is_older_than(last_write, now, write_timeout) {
                write_overdue.push((last_write, entry));
            }
        }
        sync_overdue.sort_by(by_age);
        write_overdue.sort_by(by_age);

        let mut seen = HashSet::new();
        sync_overdue
            .into_iter()
            .chain(write_overdue)
            .filter(|(_, e)| seen.insert(e.blobpath().to_string()))
            .take(limit)
            .map(|(_, e)| Arc::clone(e))
            .collect()
    }

    fn choose_sync_entry(&self) -> Option<Arc<CacheEntry>> {
        let now = self.ctx.clock.now();
        let mut oldest_write: Option<(DateTime<Utc>, &Arc<CacheEntry>)> = None;
        let mut oldest_sync: Option<(DateTime<Utc>, &Arc<CacheEntry>)> = None;
        for entry in self.entries.values() {
            let (state, last_write, last_sync) = entry.sync_status();
            if !state.needs_sync() {
                continue;
            }
            if oldest_write.map_or(true, |(t, _)| last_write < t) {
                oldest_write = Some((last_write, entry));
            }
            if oldest_sync.map_or(true, |(t, _)| last_sync < t) {
                oldest_sync = Some((last_sync, entry));
            }
        }

        if let Some((t, e)) = oldest_write {
            if is_older_than(t, now, self.ctx.config.write_timeout()) {
                return Some(Arc::clone(e));
            }
        }
        if let Some((t, e)) = oldest_sync {
            if is_older_than(t, now, self.ctx.config.sync_timeout()) {
                return Some(Arc::clone(e));
            }
        }
        None
    }
}
