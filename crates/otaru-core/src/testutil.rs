use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, Once};

use otaru_crypto::Cipher;
use otaru_storage::{BlobStore, BlobWriter, MemBlobStore};
use otaru_types::flags::OpenFlags;
use otaru_types::BlobVersion;

use crate::cachedblobstore::{CachedBlobStore, QueryVersion, StoreContext, VersionCache};
use crate::clock::ManualClock;
use crate::config::CacheConfig;
use crate::error::{OtaruError, Result};
use crate::scheduler::ThreadScheduler;

static TEST_LOGGING_INIT: Once = Once::new();

pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

const TEST_KEY: [u8; 32] = *b"0123456789abcdef0123456789abcdef";

pub fn test_cipher() -> Cipher {
    Cipher::new(&TEST_KEY)
}

pub fn test_cipher_arc() -> Arc<Cipher> {
    Arc::new(test_cipher())
}

/// Deterministic non-repeating-looking bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 251) as u8).collect()
}

/// Test blob format: the first byte is the version.
pub fn query_test_version(r: &mut dyn Read) -> Result<BlobVersion> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Ok(0),
            Ok(_) => return Ok(b[0] as BlobVersion),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(OtaruError::from_io(e)),
        }
    }
}

pub fn test_version_query() -> Arc<dyn QueryVersion> {
    Arc::new(query_test_version)
}

pub fn write_versioned_blob(bs: &dyn BlobStore, blobpath: &str, version: u8) {
    let mut w = bs.open_writer(blobpath).unwrap();
    w.write_all(&[version]).unwrap();
    w.close().unwrap();
}

/// Asserts the test version of a blob. Version 0 also accepts a missing blob.
pub fn assert_blob_version(bs: &dyn BlobStore, blobpath: &str, expected: BlobVersion) {
    let actual = match bs.open_reader(blobpath) {
        Ok(mut r) => query_test_version(&mut r).unwrap(),
        Err(e) if e.is_not_found() => 0,
        Err(e) => panic!("open_reader('{blobpath}') failed: {e}"),
    };
    assert_eq!(
        actual, expected,
        "version of '{blobpath}' on {}",
        bs.impl_name()
    );
}

#[derive(Default)]
struct GateState {
    paused: bool,
    failing: bool,
}

#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// A [`MemBlobStore`] whose readers can be held or made to fail.
pub struct PausableBlobStore {
    inner: MemBlobStore,
    gate: Arc<Gate>,
}

impl PausableBlobStore {
    pub fn new() -> Self {
        Self {
            inner: MemBlobStore::new(),
            gate: Arc::new(Gate::default()),
        }
    }

    pub fn mem(&self) -> &MemBlobStore {
        &self.inner
    }

    /// Block every read until [`PausableBlobStore::resume`].
    pub fn pause(&self) {
        self.gate.state.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.gate.state.lock().unwrap().paused = false;
        self.gate.changed.notify_all();
    }

    pub fn fail_reads(&self, fail: bool) {
        self.gate.state.lock().unwrap().failing = fail;
        self.gate.changed.notify_all();
    }
}

struct GatedReader {
    inner: Box<dyn Read + Send>,
    gate: Arc<Gate>,
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.gate.state.lock().unwrap();
        while st.paused && !st.failing {
            st = self.gate.changed.wait(st).unwrap();
        }
        if st.failing {
            return Err(io::Error::other("injected read failure"));
        }
        drop(st);
        self.inner.read(buf)
    }
}

impl BlobStore for PausableBlobStore {
    fn open_reader(&self, blobpath: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(GatedReader {
            inner: self.inner.open_reader(blobpath)?,
            gate: Arc::clone(&self.gate),
        }))
    }

    fn open_writer(&self, blobpath: &str) -> Result<Box<dyn BlobWriter>> {
        self.inner.open_writer(blobpath)
    }

    fn impl_name(&self) -> &'static str {
        "PausableBlobStore"
    }

    fn flags(&self) -> OpenFlags {
        self.inner.flags()
    }

    fn blob_size(&self, blobpath: &str) -> Result<i64> {
        self.inner.blob_size(blobpath)
    }

    fn list_blobs(&self) -> Result<Vec<String>> {
        self.inner.list_blobs()
    }

    fn remove_blob(&self, blobpath: &str) -> Result<()> {
        self.inner.remove_blob(blobpath)
    }

    fn total_size(&self) -> Result<i64> {
        self.inner.total_size()
    }
}

/// Backend, cache and collaborators for building cached stores in tests.
pub struct TestEnv {
    pub backend: Arc<PausableBlobStore>,
    pub cache: Arc<MemBlobStore>,
    pub scheduler: Arc<ThreadScheduler>,
    pub clock: Arc<ManualClock>,
    pub config: CacheConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        init_test_logging();
        Self {
            backend: Arc::new(PausableBlobStore::new()),
            cache: Arc::new(MemBlobStore::new()),
            scheduler: Arc::new(ThreadScheduler::new()),
            clock: Arc::new(ManualClock::starting_now()),
            config: CacheConfig {
                num_sync_workers: 2,
                sync_grace_period_ms: 10,
                invalidate_block_size: 1024,
                ..CacheConfig::default()
            },
        }
    }

    pub fn store(&self) -> CachedBlobStore {
        self.store_with_flags(OpenFlags::RDWR_CREATE)
    }

    pub fn store_with_flags(&self, flags: OpenFlags) -> CachedBlobStore {
        CachedBlobStore::builder(
            self.backend.clone(),
            self.cache.clone(),
            self.scheduler.clone(),
            test_version_query(),
        )
        .flags(flags)
        .config(self.config.clone())
        .clock(self.clock.clone())
        .snapshot_cipher(test_cipher_arc())
        .build()
        .unwrap()
    }

    pub(crate) fn context(&self) -> Arc<StoreContext> {
        let backend: Arc<dyn BlobStore> = self.backend.clone();
        Arc::new(StoreContext {
            version_cache: Arc::new(VersionCache::new(backend.clone(), test_version_query())),
            backend,
            cache: self.cache.clone(),
            query: test_version_query(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        })
    }
}
