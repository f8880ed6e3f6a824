pub mod blobpath;
pub mod cancellable;
pub mod file;
pub mod memory;
pub mod positioned;

use std::io::{Read, Write};

pub use blobpath::generate_new_blob_path;
pub use cancellable::{CancelToken, CancellableReader};
pub use file::FileBlobStore;
pub use memory::MemBlobStore;
pub use positioned::{OffsetReader, OffsetWriter};

use otaru_types::error::{OtaruError, Result};
use otaru_types::flags::OpenFlags;

/// Streaming writer for a whole blob.
///
/// Nothing is visible to readers of the store until [`BlobWriter::close`]
/// succeeds. Dropping the writer without closing it discards the bytes.
pub trait BlobWriter: Write + Send {
    fn close(self: Box<Self>) -> Result<()>;
}

/// A whole-blob store: the shape of the remote backend.
///
/// Capabilities beyond `open_reader`/`open_writer` are optional; the default
/// implementations report [`OtaruError::Unsupported`].
pub trait BlobStore: Send + Sync {
    /// Open a blob for sequential reading. Fails with `NotFound` when absent.
    fn open_reader(&self, blobpath: &str) -> Result<Box<dyn Read + Send>>;

    /// Open a blob for sequential writing, replacing any prior content on close.
    fn open_writer(&self, blobpath: &str) -> Result<Box<dyn BlobWriter>>;

    /// Human-readable implementation name for logs.
    fn impl_name(&self) -> &'static str;

    /// Modes this store supports.
    fn flags(&self) -> OpenFlags {
        OpenFlags::RDWR_CREATE
    }

    fn blob_size(&self, _blobpath: &str) -> Result<i64> {
        Err(unsupported(self.impl_name(), "blob_size"))
    }

    fn list_blobs(&self) -> Result<Vec<String>> {
        Err(unsupported(self.impl_name(), "list_blobs"))
    }

    fn remove_blob(&self, _blobpath: &str) -> Result<()> {
        Err(unsupported(self.impl_name(), "remove_blob"))
    }

    /// Sum of all blob sizes, for cache capacity accounting.
    fn total_size(&self) -> Result<i64> {
        Err(unsupported(self.impl_name(), "total_size"))
    }
}

fn unsupported(impl_name: &str, op: &str) -> OtaruError {
    OtaruError::Unsupported(format!("{impl_name} does not support {op}"))
}

/// Positioned I/O on a single open blob.
pub trait BlobHandle: Send {
    /// Fill `buf` from `offset`. Reading past the end is an error.
    fn pread(&mut self, buf: &mut [u8], offset: i64) -> Result<()>;

    /// Write `buf` at `offset`, growing the blob (zero-filled) as needed.
    fn pwrite(&mut self, buf: &[u8], offset: i64) -> Result<()>;

    fn size(&self) -> Result<i64>;

    fn truncate(&mut self, size: i64) -> Result<()>;

    fn flags(&self) -> OpenFlags;

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<H: BlobHandle + ?Sized> BlobHandle for Box<H> {
    fn pread(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        (**self).pread(buf, offset)
    }

    fn pwrite(&mut self, buf: &[u8], offset: i64) -> Result<()> {
        (**self).pwrite(buf, offset)
    }

    fn size(&self) -> Result<i64> {
        (**self).size()
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        (**self).truncate(size)
    }

    fn flags(&self) -> OpenFlags {
        (**self).flags()
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl<H: BlobHandle + ?Sized> BlobHandle for &mut H {
    fn pread(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        (**self).pread(buf, offset)
    }

    fn pwrite(&mut self, buf: &[u8], offset: i64) -> Result<()> {
        (**self).pwrite(buf, offset)
    }

    fn size(&self) -> Result<i64> {
        (**self).size()
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        (**self).truncate(size)
    }

    fn flags(&self) -> OpenFlags {
        (**self).flags()
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// A store that can also hand out positioned-I/O handles: the local cache.
pub trait RandomAccessBlobStore: BlobStore {
    /// Open `blobpath` with `flags`, masked by the store's own flags.
    ///
    /// Fails with `NotFound` if the blob is absent and `CREATE` was not
    /// requested.
    fn open(&self, blobpath: &str, flags: OpenFlags) -> Result<Box<dyn BlobHandle>>;
}

/// Reject blob paths that could escape a store's root.
pub fn validate_blobpath(blobpath: &str) -> Result<()> {
    if blobpath.is_empty() {
        return Err(OtaruError::InvalidPath("empty".into()));
    }
    if blobpath.starts_with('/') || blobpath.starts_with('\\') {
        return Err(OtaruError::InvalidPath(format!("absolute path '{blobpath}'")));
    }
    if blobpath.contains('\\') {
        return Err(OtaruError::InvalidPath(format!(
            "contains backslash '{blobpath}'"
        )));
    }
    if std::path::Path::new(blobpath)
        .components()
        .any(|c| c == std::path::Component::ParentDir)
    {
        return Err(OtaruError::InvalidPath(format!(
            "parent traversal '{blobpath}'"
        )));
    }
    Ok(())
}
