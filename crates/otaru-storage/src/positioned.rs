use std::io::{self, Read, Write};

use crate::BlobHandle;
use otaru_types::error::OtaruError;

/// Sequential [`Read`] over a [`BlobHandle`], starting at an offset.
///
/// Reads stop at the handle's current size.
pub struct OffsetReader<H: BlobHandle> {
    handle: H,
    offset: i64,
}

impl<H: BlobHandle> OffsetReader<H> {
    pub fn new(handle: H, offset: i64) -> Self {
        Self { handle, offset }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn into_inner(self) -> H {
        self.handle
    }
}

impl<H: BlobHandle> Read for OffsetReader<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.handle.size().map_err(OtaruError::into_io)?;
        let remaining = (size - self.offset).max(0) as usize;
        let n = buf.len().min(remaining);
        if n == 0 {
            return Ok(0);
        }
        self.handle
            .pread(&mut buf[..n], self.offset)
            .map_err(OtaruError::into_io)?;
        self.offset += n as i64;
        Ok(n)
    }
}

/// Sequential [`Write`] over a [`BlobHandle`], starting at an offset.
pub struct OffsetWriter<H: BlobHandle> {
    handle: H,
    offset: i64,
}

impl<H: BlobHandle> OffsetWriter<H> {
    pub fn new(handle: H, offset: i64) -> Self {
        Self { handle, offset }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn into_inner(self) -> H {
        self.handle
    }
}

impl<H: BlobHandle> Write for OffsetWriter<H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle
            .pwrite(buf, self.offset)
            .map_err(OtaruError::into_io)?;
        self.offset += buf.len() as i64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
