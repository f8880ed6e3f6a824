use std::sync::Arc;

use tracing::{debug, warn};

use otaru_crypto::Cipher;
use otaru_storage::{generate_new_blob_path, BlobHandle, RandomAccessBlobStore};
use otaru_types::flags::OpenFlags;

use super::chunk_io::ChunkIo;
use super::chunks_array::{ChunksArrayIo, FileChunk};
use super::header::UNKNOWN_ORIG_FILENAME;
use super::lock_manager::LockManager;
use crate::error::{OtaruError, Result};

/// Default upper bound of a single chunk.
pub const CHUNK_SPLIT_SIZE: i64 = 256 * 1024 * 1024; // 256 MiB

type OpenChunk = ChunkIo<Box<dyn BlobHandle>>;

struct CachedChunkIo {
    blobpath: String,
    writable: bool,
    cio: OpenChunk,
}

/// Positioned I/O over a logical file that is split into chunk blobs.
///
/// Keeps the most recently used chunk open between calls. Use one
/// `ChunkedFileIo` per open file; chunk headers are not re-read while the
/// chunk stays cached.
pub struct ChunkedFileIo {
    store: Arc<dyn RandomAccessBlobStore>,
    cipher: Arc<Cipher>,
    caio: Box<dyn ChunksArrayIo>,
    lock_manager: Arc<LockManager>,
    orig_filename: String,
    split_size: i64,
    cached: Option<CachedChunkIo>,
}

impl ChunkedFileIo {
    pub fn new(
        store: Arc<dyn RandomAccessBlobStore>,
        cipher: Arc<Cipher>,
        lock_manager: Arc<LockManager>,
        caio: Box<dyn ChunksArrayIo>,
    ) -> Self {
        Self {
            store,
            cipher,
            caio,
            lock_manager,
            orig_filename: UNKNOWN_ORIG_FILENAME.to_string(),
            split_size: CHUNK_SPLIT_SIZE,
            cached: None,
        }
    }

    /// Use a different chunk size limit. Chunks already written keep their
    /// extent.
    pub fn with_split_size(mut self, split_size: i64) -> Self {
        self.split_size = split_size;
        self
    }

    /// File name recorded in the header of chunks created from now on.
    pub fn set_orig_filename(&mut self, name: &str) {
        self.orig_filename = name.to_string();
    }

    fn close_cached(&mut self) {
        if let Some(mut cached) = self.cached.take() {
            if let Err(e) = cached.cio.close() {
                warn!(blobpath = %cached.blobpath, error = %e, "failed to close chunk");
            }
        }
    }

    fn chunk_io(&mut self, fc: &FileChunk, flags: OpenFlags) -> Result<&mut OpenChunk> {
        let writable = flags.is_write_allowed();
        let reusable = !flags.is_create_exclusive()
            && self
                .cached
                .as_ref()
                .is_some_and(|c| c.blobpath == fc.blobpath && (c.writable || !writable));
        if !reusable {
            self.close_cached();
            let handle = self.store.open(&fc.blobpath, flags)?;
            let cio = ChunkIo::with_metadata(
                handle,
                Arc::clone(&self.cipher),
                &self.orig_filename,
                fc.offset,
            )?;
            self.cached = Some(CachedChunkIo {
                blobpath: fc.blobpath.clone(),
                writable,
                cio,
            });
        }
        self.cached
            .as_mut()
            .map(|c| &mut c.cio)
            .ok_or_else(|| OtaruError::InvalidState("no chunk open".into()))
    }

    fn new_file_chunk(&self, offset: i64) -> Result<FileChunk> {
        let blobpath = generate_new_blob_path(self.store.as_ref())?;
        let fc = FileChunk {
            offset,
            length: 0,
            blobpath,
        };
        debug!(offset, blobpath = %fc.blobpath, "new chunk");
        Ok(fc)
    }

    /// Write as much of `p` as fits into chunk `cs[i]` at file offset
    /// `offset`, bounded by `max_len` bytes from the chunk start. Returns the
    /// number of bytes written.
    fn write_to_chunk(
        &mut self,
        cs: &mut [FileChunk],
        i: usize,
        is_new: bool,
        max_len: i64,
        offset: i64,
        p: &[u8],
    ) -> Result<usize> {
        let coff = offset - cs[i].offset;
        let n = (p.len() as i64).min(max_len - coff);
        if n <= 0 {
            return Ok(0);
        }
        let n = n as usize;

        let flags = if is_new {
            OpenFlags::RDWR | OpenFlags::CREATE | OpenFlags::EXCL
        } else {
            OpenFlags::RDWR
        };
        let fc = cs[i].clone();
        let lm = Arc::clone(&self.lock_manager);
        let _lock = lm.lock(&fc.blobpath);

        let cio = self.chunk_io(&fc, flags)?;
        cio.pwrite(&p[..n], coff)?;
        cio.sync()?;
        let new_len = cio.payload_len();

        if new_len != cs[i].length {
            cs[i].length = new_len;
            self.caio.write(cs)?;
        }
        Ok(n)
    }

    pub fn pwrite(&mut self, p: &[u8], offset: i64) -> Result<()> {
        if p.is_empty() {
            return Ok(());
        }
        if offset < 0 {
            return Err(OtaruError::OffsetOutOfRange(offset));
        }
        if !self.store.flags().is_read_write_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "chunked file write on store with flags {}",
                self.store.flags()
            )));
        }
        debug!(offset, len = p.len(), "chunked file pwrite");

        let split = self.split_size;
        let mut cs = self.caio.read()?;
        let mut remo = offset;
        let mut remp = p;

        let mut i = 0;
        while i < cs.len() && !remp.is_empty() {
            if cs[i].left() > remo {
                // Gap before cs[i]: insert a chunk, aligned down to the split
                // size but clamped between the neighbors.
                let mut newo = remo / split * split;
                let mut max_len = split;
                if i > 0 {
                    let prev_right = cs[i - 1].right();
                    if newo < prev_right {
                        max_len -= prev_right - newo;
                        newo = prev_right;
                    }
                }
                let next_left = cs[i].left();
                if newo + max_len > next_left {
                    max_len = next_left - newo;
                }

                let fc = self.new_file_chunk(newo)?;
                cs.insert(i, fc);
                self.caio.write(&cs)?;

                let n = self.write_to_chunk(&mut cs, i, true, max_len, remo, remp)?;
                remo += n as i64;
                remp = &remp[n..];
                i += 1;
                continue;
            }

            let mut max_len = split;
            if i + 1 < cs.len() {
                let next_left = cs[i + 1].left();
                if cs[i].left() + max_len > next_left {
                    max_len = next_left - cs[i].left();
                }
            }
            let n = self.write_to_chunk(&mut cs, i, false, max_len, remo, remp)?;
            remo += n as i64;
            remp = &remp[n..];
            i += 1;
        }

        while !remp.is_empty() {
            let mut newo = remo / split * split;
            let mut max_len = split;
            if let Some(last) = cs.last() {
                let last_right = last.right();
                if newo < last_right {
                    max_len -= last_right - newo;
                    newo = last_right;
                }
            }

            let fc = self.new_file_chunk(newo)?;
            cs.push(fc);
            let i = cs.len() - 1;
            let n = self.write_to_chunk(&mut cs, i, true, max_len, remo, remp)?;
            if n == 0 {
                return Err(OtaruError::InvalidState(format!(
                    "appended chunk at {newo} accepted no bytes for offset {remo}"
                )));
            }
            remo += n as i64;
            remp = &remp[n..];
        }
        Ok(())
    }

    /// Read into `p` from `offset`. Holes between chunks read as zeros.
    /// Returns fewer than `p.len()` bytes only when the file ends first.
    pub fn read_at(&mut self, p: &mut [u8], offset: i64) -> Result<usize> {
        if offset < 0 {
            return Err(OtaruError::OffsetOutOfRange(offset));
        }
        if !self.store.flags().is_read_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "chunked file read on store with flags {}",
                self.store.flags()
            )));
        }

        let cs = self.caio.read()?;
        let size = cs.last().map_or(0, FileChunk::right);
        let end = (offset + p.len() as i64).min(size.max(offset));
        let want = (end - offset) as usize;
        let p = &mut p[..want];

        let mut remo = offset;
        let mut done = 0usize;
        for fc in &cs {
            if done == want {
                break;
            }
            let rem = (want - done) as i64;
            if fc.left() >= remo + rem {
                break;
            }
            if fc.right() <= remo {
                continue;
            }

            let coff = remo - fc.left();
            if coff < 0 {
                let n = (-coff) as usize;
                p[done..done + n].fill(0);
                done += n;
                remo += n as i64;
            }
            let coff = remo - fc.left();

            let n = ((want - done) as i64).min(fc.length - coff) as usize;
            let lm = Arc::clone(&self.lock_manager);
            let _lock = lm.lock(&fc.blobpath);
            let cio = self.chunk_io(fc, OpenFlags::RDONLY)?;
            cio.pread(&mut p[done..done + n], coff)?;
            done += n;
            remo += n as i64;
        }
        p[done..].fill(0);
        Ok(want)
    }

    /// Logical file size: the right edge of the last chunk.
    pub fn size(&self) -> Result<i64> {
        Ok(self.caio.read()?.last().map_or(0, FileChunk::right))
    }

    /// Cut the file to `size` bytes, dropping chunks past it and shrinking the
    /// one that straddles it. Chunk blobs that fall away are left in place.
    pub fn truncate(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(OtaruError::OffsetOutOfRange(size));
        }
        if !self.store.flags().is_read_write_allowed() {
            return Err(OtaruError::AccessDenied(format!(
                "chunked file truncate on store with flags {}",
                self.store.flags()
            )));
        }

        let mut cs = self.caio.read()?;
        cs.retain(|c| c.left() < size);
        if let Some(i) = cs.len().checked_sub(1) {
            if cs[i].right() > size {
                let fc = cs[i].clone();
                let lm = Arc::clone(&self.lock_manager);
                let _lock = lm.lock(&fc.blobpath);
                let cio = self.chunk_io(&fc, OpenFlags::RDWR)?;
                cio.truncate(size - fc.left())?;
                cio.sync()?;
                cs[i].length = cio.payload_len();
            }
        }
        self.caio.write(&cs)
    }

    /// Release the cached chunk.
    pub fn close(&mut self) -> Result<()> {
        match self.cached.take() {
            Some(mut cached) => cached.cio.close(),
            None => Ok(()),
        }
    }
}

impl Drop for ChunkedFileIo {
    fn drop(&mut self) {
        self.close_cached();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunkstore::MemChunksArrayIo;
    use crate::testutil::{pattern, test_cipher_arc};
    use otaru_storage::{FileBlobStore, MemBlobStore};

    const SPLIT: i64 = 1024 * 1024;

    fn setup() -> (Arc<MemBlobStore>, MemChunksArrayIo, ChunkedFileIo) {
        let store = Arc::new(MemBlobStore::new());
        let caio = MemChunksArrayIo::new();
        let cfio = ChunkedFileIo::new(
            store.clone(),
            test_cipher_arc(),
            Arc::new(LockManager::new()),
            Box::new(caio.clone()),
        )
        .with_split_size(SPLIT);
        (store, caio, cfio)
    }

    #[test]
    fn hello_world_on_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileBlobStore::new(dir.path(), OpenFlags::RDWR_CREATE).unwrap());
        let caio = MemChunksArrayIo::new();
        let mut cfio = ChunkedFileIo::new(
            store,
            test_cipher_arc(),
            Arc::new(LockManager::new()),
            Box::new(caio),
        );
        let hello = b"hello, world";
        cfio.pwrite(hello, 0).unwrap();
        let mut out = vec![0u8; hello.len()];
        assert_eq!(cfio.read_at(&mut out, 0).unwrap(), hello.len());
        assert_eq!(&out, hello);
        assert_eq!(cfio.size().unwrap(), hello.len() as i64);
    }

    #[test]
    fn writes_within_split_share_one_chunk() {
        let (_store, caio, mut cfio) = setup();
        cfio.pwrite(b"hello", 123).unwrap();
        cfio.pwrite(b"world", 456).unwrap();
        let cs = caio.chunks();
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].offset, 0);
        assert_eq!(cs[0].length, 461);

        let mut out = vec![0xffu8; 461];
        assert_eq!(cfio.read_at(&mut out, 0).unwrap(), 461);
        assert!(out[..123].iter().all(|&b| b == 0));
        assert_eq!(&out[123..128], b"hello");
        assert_eq!(&out[456..461], b"world");
    }

    #[test]
    fn far_write_creates_aligned_chunk_then_gap_insert() {
        let (_store, caio, mut cfio) = setup();
        cfio.pwrite(b"far", SPLIT + 12345).unwrap();
        cfio.pwrite(b"near", 123).unwrap();

        let cs = caio.chunks();
        assert_eq!(cs.len(), 2);
        assert_eq!((cs[0].offset, cs[0].length), (0, 127));
        assert_eq!((cs[1].offset, cs[1].length), (SPLIT, 12348));

        // Hole between the chunks reads as zeros.
        let mut out = vec![0xffu8; 200];
        assert_eq!(cfio.read_at(&mut out, 100).unwrap(), 200);
        assert_eq!(&out[23..27], b"near");
        assert!(out[27..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_across_split_boundary_spans_chunks() {
        let (_store, caio, mut cfio) = setup();
        cfio.pwrite(b"far", SPLIT + 12345).unwrap();
        cfio.pwrite(b"near", 123).unwrap();
        cfio.pwrite(b"0123456789", SPLIT - 5).unwrap();

        let cs = caio.chunks();
        assert_eq!(cs.len(), 2);
        assert_eq!(cs[0].length, SPLIT);

        let mut out = [0u8; 10];
        cfio.read_at(&mut out, SPLIT - 5).unwrap();
        assert_eq!(&out, b"0123456789");
    }

    #[test]
    fn large_write_splits_into_aligned_chunks() {
        let (_store, caio, mut cfio) = setup();
        let data = pattern(SPLIT as usize * 2 + 1000);
        cfio.pwrite(&data, 500).unwrap();

        let cs = caio.chunks();
        let offsets: Vec<i64> = cs.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, SPLIT, 2 * SPLIT]);
        assert!(cs.iter().all(|c| c.length <= SPLIT));
        assert_eq!(cfio.size().unwrap(), 500 + data.len() as i64);

        let mut out = vec![0u8; data.len()];
        assert_eq!(cfio.read_at(&mut out, 500).unwrap(), data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn insert_between_chunks_is_clamped_to_neighbors() {
        let (_store, caio, mut cfio) = setup();
        cfio.pwrite(b"a", 0).unwrap();
        cfio.pwrite(b"c", 3 * SPLIT).unwrap();
        cfio.pwrite(b"b", SPLIT + 7).unwrap();

        let cs = caio.chunks();
        assert_eq!(cs.len(), 3);
        assert_eq!(cs[1].offset, SPLIT);
        assert!(cs[1].right() <= cs[2].left());
        assert!(cs[0].right() <= cs[1].left());

        let mut out = [0u8; 1];
        cfio.read_at(&mut out, SPLIT + 7).unwrap();
        assert_eq!(&out, b"b");
    }

    #[test]
    fn read_past_end_is_short() {
        let (_store, _caio, mut cfio) = setup();
        cfio.pwrite(b"abcdef", 0).unwrap();
        let mut out = [0u8; 10];
        assert_eq!(cfio.read_at(&mut out, 2).unwrap(), 4);
        assert_eq!(&out[..4], b"cdef");
        assert_eq!(cfio.read_at(&mut out, 100).unwrap(), 0);
    }

    #[test]
    fn truncate_drops_and_shrinks_chunks() {
        let (_store, caio, mut cfio) = setup();
        let data = pattern(SPLIT as usize + 100);
        cfio.pwrite(&data, 0).unwrap();
        assert_eq!(caio.chunks().len(), 2);

        cfio.truncate(SPLIT - 10).unwrap();
        let cs = caio.chunks();
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].length, SPLIT - 10);
        assert_eq!(cfio.size().unwrap(), SPLIT - 10);

        let mut out = vec![0u8; 20];
        assert_eq!(cfio.read_at(&mut out, SPLIT - 20).unwrap(), 10);
        assert_eq!(&out[..10], &data[SPLIT as usize - 20..SPLIT as usize - 10]);

        cfio.truncate(0).unwrap();
        assert!(caio.chunks().is_empty());
    }

    #[test]
    fn read_only_store_denies_writes() {
        let store = Arc::new(MemBlobStore::with_flags(OpenFlags::RDONLY));
        let mut cfio = ChunkedFileIo::new(
            store,
            test_cipher_arc(),
            Arc::new(LockManager::new()),
            Box::new(MemChunksArrayIo::new()),
        );
        match cfio.pwrite(b"x", 0) {
            Err(OtaruError::AccessDenied(_)) => {}
            other => panic!("expected AccessDenied, got: {other:?}"),
        }
        match cfio.truncate(0) {
            Err(OtaruError::AccessDenied(_)) => {}
            other => panic!("expected AccessDenied, got: {other:?}"),
        }
        let mut out = [0u8; 4];
        assert_eq!(cfio.read_at(&mut out, 0).unwrap(), 0);
    }

    #[test]
    fn chunks_record_file_metadata() {
        let (store, caio, mut cfio) = setup();
        cfio.set_orig_filename("/docs/report.txt");
        cfio.pwrite(b"x", SPLIT + 1).unwrap();
        cfio.close().unwrap();

        let cs = caio.chunks();
        let h = store.open(&cs[0].blobpath, OpenFlags::RDONLY).unwrap();
        let cio = ChunkIo::new(h, test_cipher_arc()).unwrap();
        assert_eq!(cio.header().orig_filename, "/docs/report.txt");
        assert_eq!(cio.header().orig_offset, SPLIT);
    }
}
