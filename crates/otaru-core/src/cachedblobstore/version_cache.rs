use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use otaru_crypto::Cipher;
use otaru_storage::BlobStore;
use otaru_types::BlobVersion;

use super::QueryVersion;
use crate::error::Result;
use crate::statesnapshot::{self, is_metadata_blobpath, VERSION_CACHE_BLOBPATH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionCacheStats {
    pub num_cache: usize,
}

/// Memoized payload versions of backend blobs.
///
/// A blob absent from the backend is remembered as version 0.
pub struct VersionCache {
    backend: Arc<dyn BlobStore>,
    query: Arc<dyn QueryVersion>,
    cache: Mutex<HashMap<String, BlobVersion>>,
}

impl VersionCache {
    pub fn new(backend: Arc<dyn BlobStore>, query: Arc<dyn QueryVersion>) -> Self {
        Self {
            backend,
            query,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn query(&self, blobpath: &str) -> Result<BlobVersion> {
        if let Some(v) = self.cache.lock().unwrap().get(blobpath) {
            return Ok(*v);
        }

        // The backend round trip runs without the lock; a concurrent `set`
        // for the same path wins over the value read here.
        let ver = match self.backend.open_reader(blobpath) {
            Ok(mut r) => self.query.query_version(&mut r)?,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        debug!(blobpath, version = ver, "queried backend version");

        let mut cache = self.cache.lock().unwrap();
        Ok(*cache.entry(blobpath.to_string()).or_insert(ver))
    }

    pub fn set(&self, blobpath: &str, ver: BlobVersion) {
        self.cache.lock().unwrap().insert(blobpath.to_string(), ver);
    }

    pub fn delete(&self, blobpath: &str) {
        self.cache.lock().unwrap().remove(blobpath);
    }

    pub fn stats(&self) -> VersionCacheStats {
        VersionCacheStats {
            num_cache: self.cache.lock().unwrap().len(),
        }
    }

    /// Persist the memoized versions of non-metadata blobs into `store`.
    pub fn save_state(&self, store: &dyn BlobStore, cipher: &Cipher) -> Result<()> {
        let snapshot: HashMap<String, BlobVersion> = self
            .cache
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| !is_metadata_blobpath(path))
            .map(|(path, ver)| (path.clone(), *ver))
            .collect();
        statesnapshot::save(VERSION_CACHE_BLOBPATH, store, cipher, &snapshot)?;
        debug!(entries = snapshot.len(), "saved version cache");
        Ok(())
    }

    pub fn restore_state(&self, store: &dyn BlobStore, cipher: &Cipher) -> Result<()> {
        let restored: HashMap<String, BlobVersion> =
            statesnapshot::restore(VERSION_CACHE_BLOBPATH, store, cipher)?;
        info!(entries = restored.len(), "restored version cache");
        self.cache.lock().unwrap().extend(restored);
        Ok(())
    }
}
