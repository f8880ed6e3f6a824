use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use crate::{BlobHandle, BlobStore, BlobWriter, RandomAccessBlobStore};
use otaru_types::error::{OtaruError, Result};
use otaru_types::flags::OpenFlags;

type BlobMap = HashMap<String, Arc<Mutex<Vec<u8>>>>;

/// In-memory blob store. Thread-safe via Mutex.
///
/// Handles opened on the same path share one buffer, so a write through one
/// handle is immediately visible to the others.
pub struct MemBlobStore {
    blobs: Arc<Mutex<BlobMap>>,
    flags: OpenFlags,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::with_flags(OpenFlags::RDWR_CREATE)
    }

    pub fn with_flags(flags: OpenFlags) -> Self {
        Self {
            blobs: Arc::new(Mutex::new(HashMap::new())),
            flags,
        }
    }

    /// A view of the same blobs with different store flags.
    pub fn restricted(&self, flags: OpenFlags) -> Self {
        Self {
            blobs: Arc::clone(&self.blobs),
            flags,
        }
    }

    /// Copy of a blob's current content.
    pub fn get(&self, blobpath: &str) -> Option<Vec<u8>> {
        let map = self.blobs.lock().unwrap();
        map.get(blobpath).map(|b| b.lock().unwrap().clone())
    }

    /// Replace a blob's content directly.
    pub fn put(&self, blobpath: &str, data: &[u8]) {
        store_content(&self.blobs, blobpath, data.to_vec());
    }
}

impl Default for MemBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn store_content(blobs: &Mutex<BlobMap>, blobpath: &str, data: Vec<u8>) {
    let mut map = blobs.lock().unwrap();
    match map.get(blobpath) {
        Some(existing) => *existing.lock().unwrap() = data,
        None => {
            map.insert(blobpath.to_string(), Arc::new(Mutex::new(data)));
        }
    }
}

impl BlobStore for MemBlobStore {
    fn open_reader(&self, blobpath: &str) -> Result<Box<dyn Read + Send>> {
        let data = self
            .get(blobpath)
            .ok_or_else(|| OtaruError::NotFound(blobpath.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_writer(&self, blobpath: &str) -> Result<Box<dyn BlobWriter>> {
        if !self.flags.is_write_allowed() {
            return Err(OtaruError::AccessDenied(
                "open_writer on read-only MemBlobStore".into(),
            ));
        }
        Ok(Box::new(MemBlobWriter {
            blobs: Arc::clone(&self.blobs),
            blobpath: blobpath.to_string(),
            buf: Vec::new(),
        }))
    }

    fn impl_name(&self) -> &'static str {
        "MemBlobStore"
    }

    fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn blob_size(&self, blobpath: &str) -> Result<i64> {
        let map = self.blobs.lock().unwrap();
        map.get(blobpath)
            .map(|b| b.lock().unwrap().len() as i64)
            .ok_or_else(|| OtaruError::NotFound(blobpath.to_string()))
    }

    fn list_blobs(&self) -> Result<Vec<String>> {
        let map = self.blobs.lock().unwrap();
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn remove_blob(&self, blobpath: &str) -> Result<()> {
        if !self.flags.is_write_allowed() {
            return Err(OtaruError::AccessDenied(
                "remove_blob on read-only MemBlobStore".into(),
            ));
        }
        let mut map = self.blobs.lock().unwrap();
        map.remove(blobpath)
            .map(|_| ())
            .ok_or_else(|| OtaruError::NotFound(blobpath.to_string()))
    }

    fn total_size(&self) -> Result<i64> {
        let map = self.blobs.lock().unwrap();
        Ok(map.values().map(|b| b.lock().unwrap().len() as i64).sum())
    }
}

impl RandomAccessBlobStore for MemBlobStore {
    fn open(&self, blobpath: &str, flags: OpenFlags) -> Result<Box<dyn BlobHandle>> {
        let flags = flags.mask(self.flags);
        let mut map = self.blobs.lock().unwrap();
        let content = match map.get(blobpath) {
            Some(content) => {
                if flags.is_create_exclusive() {
                    return Err(OtaruError::InvalidState(format!(
                        "blob '{blobpath}' already exists"
                    )));
                }
                Arc::clone(content)
            }
            None if flags.is_create_allowed() => {
                let content = Arc::new(Mutex::new(Vec::new()));
                map.insert(blobpath.to_string(), Arc::clone(&content));
                content
            }
            None => return Err(OtaruError::NotFound(blobpath.to_string())),
        };
        if flags.contains(OpenFlags::TRUNCATE) {
            content.lock().unwrap().clear();
        }
        Ok(Box::new(MemBlobHandle { content, flags }))
    }
}

struct MemBlobWriter {
    blobs: Arc<Mutex<BlobMap>>,
    blobpath: String,
    buf: Vec<u8>,
}

impl Write for MemBlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemBlobWriter {
    fn close(self: Box<Self>) -> Result<()> {
        let MemBlobWriter {
            blobs,
            blobpath,
            buf,
        } = *self;
        store_content(&blobs, &blobpath, buf);
        Ok(())
    }
}

pub struct MemBlobHandle {
    content: Arc<Mutex<Vec<u8>>>,
    flags: OpenFlags,
}

impl BlobHandle for MemBlobHandle {
    fn pread(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        if !self.flags.is_read_allowed() {
            return Err(OtaruError::AccessDenied("pread on write-only handle".into()));
        }
        if offset < 0 {
            return Err(OtaruError::OffsetOutOfRange(offset));
        }
        let data = self.content.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "pread [{start}, {end}) past end of {}-byte blob",
                    data.len()
                ),
            )
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: i64) -> Result<()> {
        if !self.flags.is_write_allowed() {
            return Err(OtaruError::AccessDenied("pwrite on read-only handle".into()));
        }
        if offset < 0 {
            return Err(OtaruError::OffsetOutOfRange(offset));
        }
        let mut data = self.content.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> Result<i64> {
        Ok(self.content.lock().unwrap().len() as i64)
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        if !self.flags.is_write_allowed() {
            return Err(OtaruError::AccessDenied(
                "truncate on read-only handle".into(),
            ));
        }
        if size < 0 {
            return Err(OtaruError::OffsetOutOfRange(size));
        }
        self.content.lock().unwrap().resize(size as usize, 0);
        Ok(())
    }

    fn flags(&self) -> OpenFlags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_share_content() {
        let store = MemBlobStore::new();
        let mut a = store.open("blob", OpenFlags::RDWR_CREATE).unwrap();
        let mut b = store.open("blob", OpenFlags::RDONLY).unwrap();
        a.pwrite(b"shared", 0).unwrap();

        let mut buf = [0u8; 6];
        b.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"shared");
        assert!(matches!(
            b.pwrite(b"x", 0).unwrap_err(),
            OtaruError::AccessDenied(_)
        ));
    }

    #[test]
    fn pread_past_end_fails() {
        let store = MemBlobStore::new();
        store.put("blob", b"abc");
        let mut h = store.open("blob", OpenFlags::RDONLY).unwrap();
        let mut buf = [0u8; 4];
        match h.pread(&mut buf, 0).unwrap_err() {
            OtaruError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got: {other}"),
        }
    }

    #[test]
    fn pwrite_past_end_zero_fills() {
        let store = MemBlobStore::new();
        let mut h = store.open("blob", OpenFlags::RDWR_CREATE).unwrap();
        h.pwrite(b"z", 3).unwrap();
        assert_eq!(store.get("blob").unwrap(), vec![0, 0, 0, b'z']);
    }

    #[test]
    fn writer_replaces_content_seen_by_open_handles() {
        let store = MemBlobStore::new();
        store.put("blob", b"old content");
        let h = store.open("blob", OpenFlags::RDONLY).unwrap();

        let mut w = store.open_writer("blob").unwrap();
        w.write_all(b"new").unwrap();
        assert_eq!(h.size().unwrap(), 11);
        w.close().unwrap();
        assert_eq!(h.size().unwrap(), 3);
    }

    #[test]
    fn missing_blob_without_create_is_not_found() {
        let store = MemBlobStore::new();
        assert!(store
            .open("absent", OpenFlags::RDWR)
            .err()
            .unwrap()
            .is_not_found());
        assert!(store.open_reader("absent").err().unwrap().is_not_found());
        assert!(store.blob_size("absent").unwrap_err().is_not_found());
    }

    #[test]
    fn restricted_view_masks_flags() {
        let store = MemBlobStore::new();
        store.put("blob", b"data");
        let ro = store.restricted(OpenFlags::RDONLY);
        let h = ro.open("blob", OpenFlags::RDWR_CREATE).unwrap();
        assert_eq!(h.flags(), OpenFlags::RDONLY);
        assert!(ro.open_writer("blob").is_err());
        assert_eq!(ro.list_blobs().unwrap(), vec!["blob"]);
    }
}
