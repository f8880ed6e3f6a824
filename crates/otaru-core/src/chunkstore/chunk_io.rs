use std::sync::Arc;

use tracing::debug;

use otaru_crypto::{enc_frame_size, Cipher, FRAME_MAX_PAYLOAD};
use otaru_storage::{BlobHandle, OffsetReader, OffsetWriter};
use otaru_types::flags::OpenFlags;
use otaru_types::BlobVersion;

use super::header::{ChunkHeader, CHUNK_HEADER_LENGTH, MAX_CHUNK_PAYLOAD_LEN, UNKNOWN_ORIG_FILENAME};
use crate::error::{OtaruError, Result};

/// Blob offset of content frame `i`. Every frame but the last is full-sized,
/// so the position does not depend on the payload length.
fn encrypted_frame_offset(i: usize) -> i64 {
    (CHUNK_HEADER_LENGTH + i * enc_frame_size(FRAME_MAX_PAYLOAD)) as i64
}

/// Random-access plaintext view over one encrypted chunk blob.
///
/// The header is loaded when the `ChunkIo` is created and rewritten by
/// [`ChunkIo::sync`] once content changed. Every frame write bumps the
/// payload version.
pub struct ChunkIo<H: BlobHandle> {
    handle: H,
    cipher: Arc<Cipher>,
    header: ChunkHeader,
    needs_header_update: bool,
}

impl<H: BlobHandle> ChunkIo<H> {
    pub fn new(handle: H, cipher: Arc<Cipher>) -> Result<Self> {
        Self::with_metadata(handle, cipher, UNKNOWN_ORIG_FILENAME, -1)
    }

    /// Like [`ChunkIo::new`], recording where the chunk sits in its file.
    ///
    /// The metadata only applies to a blob without content; an existing
    /// header keeps what it was written with.
    pub fn with_metadata(
        mut handle: H,
        cipher: Arc<Cipher>,
        orig_filename: &str,
        orig_offset: i64,
    ) -> Result<Self> {
        let header = if handle.size()? == 0 {
            let mut h = ChunkHeader::new(orig_filename, orig_offset);
            h.payload_version = 1;
            h
        } else {
            let mut r = OffsetReader::new(&mut handle, 0);
            ChunkHeader::read_from(&mut r, &cipher)?.ok_or_else(|| {
                OtaruError::InvalidState("chunk blob shrank while reading its header".into())
            })?
        };
        Ok(Self {
            handle,
            cipher,
            header,
            needs_header_update: false,
        })
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn payload_len(&self) -> i64 {
        self.header.payload_len()
    }

    pub fn payload_version(&self) -> BlobVersion {
        self.header.payload_version
    }

    fn frame_payload_len(&self, i: usize) -> usize {
        let start = i * FRAME_MAX_PAYLOAD;
        (self.payload_len() as usize)
            .saturating_sub(start)
            .min(FRAME_MAX_PAYLOAD)
    }

    fn read_content_frame(&mut self, i: usize, dst: &mut Vec<u8>) -> Result<()> {
        let payload_len = self.frame_payload_len(i);
        let mut sealed = self.cipher.frame_buf();
        sealed.resize(enc_frame_size(payload_len), 0);
        self.handle.pread(&mut sealed, encrypted_frame_offset(i))?;
        dst.clear();
        self.cipher.decrypt_frame(dst, &sealed)
    }

    fn write_content_frame(&mut self, i: usize, payload: &[u8]) -> Result<()> {
        let mut sealed = self.cipher.frame_buf();
        self.cipher.encrypt_frame(&mut sealed, payload)?;
        self.handle.pwrite(&sealed, encrypted_frame_offset(i))?;
        self.header.payload_version += 1;
        self.needs_header_update = true;
        Ok(())
    }

    fn set_payload_len(&mut self, len: i64) -> Result<()> {
        if len > MAX_CHUNK_PAYLOAD_LEN {
            return Err(OtaruError::PayloadTooLarge(len as u64));
        }
        self.header.payload_len = len as u32;
        Ok(())
    }

    /// Fill `buf` with plaintext starting at `offset`.
    pub fn pread(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        if !(0..=MAX_CHUNK_PAYLOAD_LEN).contains(&offset) {
            return Err(OtaruError::OffsetOutOfRange(offset));
        }
        if offset + buf.len() as i64 > self.payload_len() {
            return Err(OtaruError::OutOfBounds {
                offset,
                len: buf.len(),
                payload_len: self.payload_len(),
            });
        }

        let cipher = Arc::clone(&self.cipher);
        let mut plain = cipher.payload_buf();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset as usize + done;
            let i = pos / FRAME_MAX_PAYLOAD;
            let inframe = pos % FRAME_MAX_PAYLOAD;
            self.read_content_frame(i, &mut plain)?;
            let n = (buf.len() - done).min(plain.len() - inframe);
            buf[done..done + n].copy_from_slice(&plain[inframe..inframe + n]);
            done += n;
        }
        Ok(())
    }

    /// Write `buf` at `offset`, zero-filling any gap past the current end.
    pub fn pwrite(&mut self, buf: &[u8], offset: i64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset < 0 {
            return Err(OtaruError::OffsetOutOfRange(offset));
        }
        let end = offset + buf.len() as i64;
        if end > MAX_CHUNK_PAYLOAD_LEN {
            return Err(OtaruError::PayloadTooLarge(end as u64));
        }

        let cipher = Arc::clone(&self.cipher);
        let mut payload = cipher.payload_buf();

        while self.payload_len() < offset {
            let cur = self.payload_len() as usize;
            let i = cur / FRAME_MAX_PAYLOAD;
            if cur % FRAME_MAX_PAYLOAD == 0 {
                payload.clear();
            } else {
                self.read_content_frame(i, &mut payload)?;
            }
            let fill_to = (offset as usize - i * FRAME_MAX_PAYLOAD).min(FRAME_MAX_PAYLOAD);
            payload.resize(fill_to, 0);
            self.write_content_frame(i, &payload)?;
            self.set_payload_len((i * FRAME_MAX_PAYLOAD + fill_to) as i64)?;
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = offset as usize + done;
            let i = pos / FRAME_MAX_PAYLOAD;
            let inframe = pos % FRAME_MAX_PAYLOAD;
            let frame_start = i * FRAME_MAX_PAYLOAD;

            if (frame_start as i64) < self.payload_len() {
                self.read_content_frame(i, &mut payload)?;
            } else {
                payload.clear();
            }
            let n = (buf.len() - done).min(FRAME_MAX_PAYLOAD - inframe);
            if inframe + n > payload.len() {
                payload.resize(inframe + n, 0);
            }
            payload[inframe..inframe + n].copy_from_slice(&buf[done..done + n]);
            self.write_content_frame(i, &payload)?;

            let frame_end = (frame_start + payload.len()) as i64;
            if frame_end > self.payload_len() {
                self.set_payload_len(frame_end)?;
            }
            done += n;
        }
        debug!(
            offset,
            len = buf.len(),
            payload_len = self.payload_len(),
            version = self.header.payload_version,
            "chunk pwrite"
        );
        Ok(())
    }

    /// Shrink the payload to `size` bytes. Growing is not supported here;
    /// write zeros with [`ChunkIo::pwrite`] instead.
    pub fn truncate(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(OtaruError::OffsetOutOfRange(size));
        }
        let old_len = self.payload_len();
        if size > old_len {
            return Err(OtaruError::InvalidState(format!(
                "chunk truncate can only shrink: {size} > payload length {old_len}"
            )));
        }
        if size == old_len {
            return Ok(());
        }

        let i = size as usize / FRAME_MAX_PAYLOAD;
        let inframe = size as usize % FRAME_MAX_PAYLOAD;
        let blob_len = if inframe == 0 {
            encrypted_frame_offset(i)
        } else {
            let cipher = Arc::clone(&self.cipher);
            let mut payload = cipher.payload_buf();
            self.read_content_frame(i, &mut payload)?;
            payload.truncate(inframe);
            self.set_payload_len(size)?;
            self.write_content_frame(i, &payload)?;
            encrypted_frame_offset(i) + enc_frame_size(inframe) as i64
        };
        self.set_payload_len(size)?;
        self.header.payload_version += 1;
        self.needs_header_update = true;
        if self.handle.size()? > blob_len {
            self.handle.truncate(blob_len)?;
        }
        Ok(())
    }

    /// Rewrite the header if content changed since it was last written.
    pub fn sync(&mut self) -> Result<()> {
        if !self.needs_header_update {
            return Ok(());
        }
        let mut w = OffsetWriter::new(&mut self.handle, 0);
        self.header.write_to(&mut w, &self.cipher)?;
        self.needs_header_update = false;
        debug!(
            payload_len = self.header.payload_len,
            version = self.header.payload_version,
            "wrote chunk header"
        );
        Ok(())
    }

    /// Sync the header and release the underlying handle.
    pub fn close(&mut self) -> Result<()> {
        self.sync()?;
        self.handle.close()
    }

    pub fn into_inner(self) -> H {
        self.handle
    }
}

impl<H: BlobHandle> BlobHandle for ChunkIo<H> {
    fn pread(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        ChunkIo::pread(self, buf, offset)
    }

    fn pwrite(&mut self, buf: &[u8], offset: i64) -> Result<()> {
        ChunkIo::pwrite(self, buf, offset)
    }

    fn size(&self) -> Result<i64> {
        Ok(self.payload_len())
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        ChunkIo::truncate(self, size)
    }

    fn flags(&self) -> OpenFlags {
        self.handle.flags()
    }

    fn sync(&mut self) -> Result<()> {
        ChunkIo::sync(self)
    }

    fn close(&mut self) -> Result<()> {
        ChunkIo::close(self)
    }
}
