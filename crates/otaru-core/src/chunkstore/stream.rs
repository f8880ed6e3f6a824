use std::io::{self, Read, Write};
use std::sync::Arc;

use otaru_crypto::{Cipher, FrameReader, FrameWriter};
use otaru_types::BlobVersion;

use super::header::ChunkHeader;
use crate::cachedblobstore::QueryVersion;
use crate::error::{OtaruError, Result};

/// Sequential writer for a whole chunk blob: the header followed by
/// exactly `header.payload_len` bytes of content.
pub struct ChunkWriter<'a, W: Write> {
    frames: FrameWriter<'a, W>,
}

impl<'a, W: Write> ChunkWriter<'a, W> {
    pub fn new(mut dst: W, cipher: &'a Cipher, header: &ChunkHeader) -> Result<Self> {
        header.write_to(&mut dst, cipher)?;
        Ok(Self {
            frames: FrameWriter::new(dst, cipher, header.payload_len as usize),
        })
    }

    /// Seal the last frame and return the destination.
    pub fn finish(self) -> Result<W> {
        self.frames.finish()
    }
}

impl<W: Write> Write for ChunkWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.frames.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.frames.flush()
    }
}

/// Sequential reader for a whole chunk blob.
pub struct ChunkReader<'a, R: Read> {
    header: ChunkHeader,
    frames: FrameReader<'a, R>,
}

impl<'a, R: Read> ChunkReader<'a, R> {
    pub fn new(mut src: R, cipher: &'a Cipher) -> Result<Self> {
        let header = ChunkHeader::read_from(&mut src, cipher)?.ok_or_else(|| {
            OtaruError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunk stream ended before its header",
            ))
        })?;
        let len = header.payload_len as usize;
        Ok(Self {
            header,
            frames: FrameReader::new(src, cipher, len),
        })
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Content length announced by the header.
    pub fn len(&self) -> usize {
        self.header.payload_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Read> Read for ChunkReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.frames.read(buf)
    }
}

/// Payload version recorded in a chunk blob's header. An empty blob is at
/// version 0.
pub fn query_chunk_version<R: Read>(mut r: R, cipher: &Cipher) -> Result<BlobVersion> {
    Ok(ChunkHeader::read_from(&mut r, cipher)?
        .map(|h| h.payload_version)
        .unwrap_or(0))
}

/// [`QueryVersion`] for blobs in chunk format.
#[derive(Debug, Clone)]
pub struct ChunkVersionQuery {
    cipher: Arc<Cipher>,
}

impl ChunkVersionQuery {
    pub fn new(cipher: Arc<Cipher>) -> Self {
        Self { cipher }
    }
}

impl QueryVersion for ChunkVersionQuery {
    fn query_version(&self, r: &mut dyn Read) -> Result<BlobVersion> {
        query_chunk_version(r, &self.cipher)
    }
}
