use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::{validate_blobpath, BlobHandle, BlobStore, BlobWriter, RandomAccessBlobStore};
use otaru_types::error::{OtaruError, Result};
use otaru_types::flags::OpenFlags;

/// Prefix of in-flight writer temp files; hidden from `list_blobs`.
const TEMP_PREFIX: &str = ".otaru-tmp";

/// Blob store backed by one file per blob under a root directory.
pub struct FileBlobStore {
    root: PathBuf,
    flags: OpenFlags,
}

impl FileBlobStore {
    /// Create a store rooted at `root`. A writable store creates the directory
    /// if needed; a read-only one requires it to exist.
    pub fn new(root: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let root = root.as_ref();
        if flags.is_write_allowed() {
            fs::create_dir_all(root)?;
        }
        let meta = fs::metadata(root)?;
        if !meta.is_dir() {
            return Err(OtaruError::Config(format!(
                "blob store root '{}' is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root: fs::canonicalize(root)?,
            flags,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, blobpath: &str) -> Result<PathBuf> {
        validate_blobpath(blobpath)?;
        Ok(self.root.join(blobpath))
    }

    fn require_write(&self, op: &str) -> Result<()> {
        if !self.flags.is_write_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "{op} on read-only FileBlobStore"
            )));
        }
        Ok(())
    }

    fn list_recursive(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), out)?;
            } else if file_type.is_file() {
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let blobpath = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(blobpath);
                }
            }
        }
        Ok(())
    }
}

fn not_found_as(blobpath: &str, e: std::io::Error) -> OtaruError {
    if e.kind() == std::io::ErrorKind::NotFound {
        OtaruError::NotFound(blobpath.to_string())
    } else {
        e.into()
    }
}

impl BlobStore for FileBlobStore {
    fn open_reader(&self, blobpath: &str) -> Result<Box<dyn Read + Send>> {
        if !self.flags.is_read_allowed() {
            return Err(OtaruError::AccessDenied(
                "read on write-only FileBlobStore".into(),
            ));
        }
        let path = self.resolve(blobpath)?;
        let file = fs::File::open(&path).map_err(|e| not_found_as(blobpath, e))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }

    fn open_writer(&self, blobpath: &str) -> Result<Box<dyn BlobWriter>> {
        self.require_write("open_writer")?;
        let path = self.resolve(blobpath)?;
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir)?;
        let tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)?;
        Ok(Box::new(FileBlobWriter { tmp, path }))
    }

    fn impl_name(&self) -> &'static str {
        "FileBlobStore"
    }

    fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn blob_size(&self, blobpath: &str) -> Result<i64> {
        let path = self.resolve(blobpath)?;
        let meta = fs::metadata(&path).map_err(|e| not_found_as(blobpath, e))?;
        Ok(meta.len() as i64)
    }

    fn list_blobs(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.list_recursive(&self.root, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn remove_blob(&self, blobpath: &str) -> Result<()> {
        self.require_write("remove_blob")?;
        let path = self.resolve(blobpath)?;
        fs::remove_file(&path).map_err(|e| not_found_as(blobpath, e))?;
        debug!(blobpath, "blob removed");
        Ok(())
    }

    fn total_size(&self) -> Result<i64> {
        let mut total = 0i64;
        for blobpath in self.list_blobs()? {
            match self.blob_size(&blobpath) {
                Ok(n) => total += n,
                // Removed between listing and stat.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

impl RandomAccessBlobStore for FileBlobStore {
    fn open(&self, blobpath: &str, flags: OpenFlags) -> Result<Box<dyn BlobHandle>> {
        let flags = flags.mask(self.flags);
        if !flags.is_read_allowed() && !flags.is_write_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "open '{blobpath}': no usable mode in store flags {}",
                self.flags
            )));
        }
        let path = self.resolve(blobpath)?;
        if flags.is_create_allowed() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::OpenOptions::new()
            .read(flags.is_read_allowed())
            .write(flags.is_write_allowed())
            .create(flags.is_create_allowed() && !flags.is_create_exclusive())
            .create_new(flags.is_create_exclusive())
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .open(&path)
            .map_err(|e| not_found_as(blobpath, e))?;
        Ok(Box::new(FileBlobHandle { file, flags }))
    }
}

struct FileBlobWriter {
    tmp: NamedTempFile,
    path: PathBuf,
}

impl Write for FileBlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tmp.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.tmp.flush()
    }
}

impl BlobWriter for FileBlobWriter {
    fn close(self: Box<Self>) -> Result<()> {
        let FileBlobWriter { mut tmp, path } = *self;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(path = %path.display(), "blob committed");
        Ok(())
    }
}

pub struct FileBlobHandle {
    file: fs::File,
    flags: OpenFlags,
}

impl BlobHandle for FileBlobHandle {
    fn pread(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(OtaruError::OffsetOutOfRange(offset));
        }
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(OtaruError::OffsetOutOfRange(offset));
        }
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn size(&self) -> Result<i64> {
        Ok(self.file.metadata()?.len() as i64)
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(OtaruError::OffsetOutOfRange(size));
        }
        self.file.set_len(size as u64)?;
        Ok(())
    }

    fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_store(dir: &Path) -> FileBlobStore {
        FileBlobStore::new(dir, OpenFlags::RDWR_CREATE).unwrap()
    }

    fn put(store: &FileBlobStore, blobpath: &str, data: &[u8]) {
        let mut w = store.open_writer(blobpath).unwrap();
        w.write_all(data).unwrap();
        w.close().unwrap();
    }

    fn get(store: &FileBlobStore, blobpath: &str) -> Vec<u8> {
        let mut out = Vec::new();
        store
            .open_reader(blobpath)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn reader_on_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = rw_store(dir.path());
        match store.open_reader("nosuchblob") {
            Err(OtaruError::NotFound(p)) => assert_eq!(p, "nosuchblob"),
            Err(other) => panic!("expected NotFound, got: {other}"),
            Ok(_) => panic!("expected NotFound, got a reader"),
        }
    }

    #[test]
    fn writer_is_invisible_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = rw_store(dir.path());
        let mut w = store.open_writer("blob").unwrap();
        w.write_all(b"hello").unwrap();
        assert!(store.list_blobs().unwrap().is_empty());
        w.close().unwrap();
        assert_eq!(store.list_blobs().unwrap(), vec!["blob"]);
        assert_eq!(get(&store, "blob"), b"hello");
    }

    #[test]
    fn dropped_writer_discards_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = rw_store(dir.path());
        put(&store, "blob", b"v1");
        {
            let mut w = store.open_writer("blob").unwrap();
            w.write_all(b"v2 never committed").unwrap();
        }
        assert_eq!(get(&store, "blob"), b"v1");
        assert_eq!(store.list_blobs().unwrap(), vec!["blob"]);
    }

    #[test]
    fn writer_overwrites_existing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = rw_store(dir.path());
        put(&store, "manifest", b"version1-long");
        put(&store, "manifest", b"version2");
        assert_eq!(get(&store, "manifest"), b"version2");
        assert_eq!(store.blob_size("manifest").unwrap(), 8);
    }

    #[test]
    fn open_masks_flags_and_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = rw_store(dir.path());
        assert!(store
            .open("absent", OpenFlags::RDONLY)
            .err()
            .unwrap()
            .is_not_found());

        let h = store.open("created", OpenFlags::RDWR_CREATE).unwrap();
        assert_eq!(h.flags(), OpenFlags::RDWR_CREATE);
        assert_eq!(h.size().unwrap(), 0);

        let ro = FileBlobStore::new(dir.path(), OpenFlags::RDONLY).unwrap();
        let h = ro.open("created", OpenFlags::RDWR_CREATE).unwrap();
        assert_eq!(h.flags(), OpenFlags::RDONLY);
    }

    #[test]
    fn positioned_io_grows_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let store = rw_store(dir.path());
        let mut h = store.open("blob", OpenFlags::RDWR_CREATE).unwrap();
        h.pwrite(b"world", 6).unwrap();
        h.pwrite(b"hello ", 0).unwrap();
        assert_eq!(h.size().unwrap(), 11);

        let mut buf = [0u8; 11];
        h.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello world");

        let mut past = [0u8; 4];
        assert!(h.pread(&mut past, 9).is_err());

        h.truncate(5).unwrap();
        assert_eq!(h.size().unwrap(), 5);
    }

    #[test]
    fn read_only_store_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        put(&rw_store(dir.path()), "blob", b"x");
        let ro = FileBlobStore::new(dir.path(), OpenFlags::RDONLY).unwrap();
        assert!(matches!(
            ro.open_writer("blob").err().unwrap(),
            OtaruError::AccessDenied(_)
        ));
        assert!(matches!(
            ro.remove_blob("blob").unwrap_err(),
            OtaruError::AccessDenied(_)
        ));
    }

    #[test]
    fn remove_and_total_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = rw_store(dir.path());
        put(&store, "a", &[1u8; 10]);
        put(&store, "b", &[2u8; 32]);
        assert_eq!(store.total_size().unwrap(), 42);

        store.remove_blob("a").unwrap();
        assert!(store.remove_blob("a").unwrap_err().is_not_found());
        assert_eq!(store.list_blobs().unwrap(), vec!["b"]);
        assert_eq!(store.total_size().unwrap(), 32);
    }

    #[test]
    fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = rw_store(dir.path());
        assert!(store.open_reader("../../etc/passwd").is_err());
        assert!(store.open_writer("../escape").is_err());
        assert!(store.open("/absolute", OpenFlags::RDONLY).is_err());
    }

    #[test]
    fn concurrent_writers_are_atomic() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(rw_store(dir.path()));
        let payload_a = vec![0xAAu8; 1024 * 64];
        let payload_b = vec![0xBBu8; 1024 * 64];

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [payload_a.clone(), payload_b.clone()]
            .into_iter()
            .map(|payload| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut w = store.open_writer("contested").unwrap();
                    w.write_all(&payload).unwrap();
                    w.close().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let result = get(&store, "contested");
        assert!(result == payload_a || result == payload_b);
    }
}
