use std::io::{self, Read, Write};

use crate::pool::PooledBuf;
use crate::{enc_frame_size, Cipher, FRAME_MAX_PAYLOAD};
use otaru_types::error::{OtaruError, Result};

/// Seals a byte stream of known total length into consecutive frames.
///
/// Every frame except the last carries [`FRAME_MAX_PAYLOAD`] bytes. The
/// writer must see exactly `len_total` bytes before [`FrameWriter::finish`].
pub struct FrameWriter<'a, W: Write> {
    dst: W,
    cipher: &'a Cipher,
    len_total: usize,
    len_written: usize,
    pending: PooledBuf<'a>,
    sealed: PooledBuf<'a>,
}

impl<'a, W: Write> FrameWriter<'a, W> {
    pub fn new(dst: W, cipher: &'a Cipher, len_total: usize) -> Self {
        Self {
            dst,
            cipher,
            len_total,
            len_written: 0,
            pending: cipher.payload_buf(),
            sealed: cipher.frame_buf(),
        }
    }

    fn flush_frame(&mut self) -> Result<()> {
        self.sealed.clear();
        self.cipher.encrypt_frame(&mut self.sealed, &self.pending)?;
        self.dst.write_all(&self.sealed)?;
        self.pending.clear();
        Ok(())
    }

    /// Seal the trailing partial frame and hand back the destination.
    pub fn finish(mut self) -> Result<W> {
        if self.len_written != self.len_total {
            return Err(OtaruError::InvalidState(format!(
                "frame stream closed after {} of {} planned bytes",
                self.len_written, self.len_total
            )));
        }
        if !self.pending.is_empty() {
            self.flush_frame()?;
        }
        self.dst.flush()?;
        Ok(self.dst)
    }
}

impl<W: Write> Write for FrameWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.len_written + buf.len() > self.len_total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame stream overflow: {} + {} exceeds planned {}",
                    self.len_written,
                    buf.len(),
                    self.len_total
                ),
            ));
        }
        let mut rest = buf;
        while !rest.is_empty() {
            let n = (FRAME_MAX_PAYLOAD - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if self.pending.len() == FRAME_MAX_PAYLOAD {
                self.flush_frame().map_err(OtaruError::into_io)?;
            }
        }
        self.len_written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dst.flush()
    }
}

/// Opens a stream of frames produced by [`FrameWriter`].
pub struct FrameReader<'a, R: Read> {
    src: R,
    cipher: &'a Cipher,
    len_total: usize,
    len_read: usize,
    sealed: PooledBuf<'a>,
    plain: PooledBuf<'a>,
    pos: usize,
}

impl<'a, R: Read> FrameReader<'a, R> {
    pub fn new(src: R, cipher: &'a Cipher, len_total: usize) -> Self {
        Self {
            src,
            cipher,
            len_total,
            len_read: 0,
            sealed: cipher.frame_buf(),
            plain: cipher.payload_buf(),
            pos: 0,
        }
    }

    fn read_next_frame(&mut self) -> Result<()> {
        let payload_len = (self.len_total - self.len_read).min(FRAME_MAX_PAYLOAD);
        self.sealed.resize(enc_frame_size(payload_len), 0);
        self.src.read_exact(&mut self.sealed)?;
        self.plain.clear();
        self.cipher.decrypt_frame(&mut self.plain, &self.sealed)?;
        self.len_read += payload_len;
        self.pos = 0;
        Ok(())
    }

    /// True once every planned byte has been decrypted and handed out.
    pub fn has_read_all(&self) -> bool {
        self.len_read == self.len_total && self.pos == self.plain.len()
    }

    pub fn into_inner(self) -> R {
        self.src
    }
}

impl<R: Read> Read for FrameReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos == self.plain.len() {
            if self.len_read == self.len_total {
                return Ok(0);
            }
            self.read_next_frame().map_err(OtaruError::into_io)?;
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
