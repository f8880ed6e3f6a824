use std::sync::Arc;

use otaru_storage::BlobHandle;
use otaru_types::flags::OpenFlags;

use super::entry::CacheEntry;
use crate::error::{OtaruError, Result};

/// A handle on a [`CacheEntry`], limited to the mode it was opened with.
///
/// Dropping the handle closes it.
pub struct CachedBlobHandle {
    entry: Arc<CacheEntry>,
    id: u64,
    flags: OpenFlags,
    closed: bool,
}

impl CachedBlobHandle {
    pub(crate) fn new(entry: Arc<CacheEntry>, id: u64, flags: OpenFlags) -> Self {
        Self {
            entry,
            id,
            flags,
            closed: false,
        }
    }

    pub fn blobpath(&self) -> &str {
        self.entry.blobpath()
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(OtaruError::InvalidState(format!(
                "handle on '{}' is closed",
                self.entry.blobpath()
            )));
        }
        Ok(())
    }

    fn require(&self, allowed: bool, op: &str) -> Result<()> {
        self.check_open()?;
        if !allowed {
            return Err(OtaruError::AccessDenied(format!(
                "{op} on '{}' opened with flags '{}'",
                self.entry.blobpath(),
                self.flags
            )));
        }
        Ok(())
    }
}

impl BlobHandle for CachedBlobHandle {
    fn pread(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        self.require(self.flags.is_read_allowed(), "pread")?;
        self.entry.pread(buf, offset)
    }

    fn pwrite(&mut self, buf: &[u8], offset: i64) -> Result<()> {
        self.require(self.flags.is_write_allowed(), "pwrite")?;
        self.entry.pwrite(buf, offset)
    }

    fn size(&self) -> Result<i64> {
        self.check_open()?;
        Ok(self.entry.size())
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        self.require(self.flags.is_write_allowed(), "truncate")?;
        self.entry.truncate(size)
    }

    fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn sync(&mut self) -> Result<()> {
        if !self.flags.is_write_allowed() {
            return Ok(());
        }
        self.check_open()?;
        self.entry.sync()
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.entry.close_handle(self.id);
        }
        Ok(())
    }
}

impl Drop for CachedBlobHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.entry.close_handle(self.id);
        }
    }
}
