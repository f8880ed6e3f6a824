//! Encrypted, compressed snapshots of in-memory state stored as a single
//! chunk blob.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use otaru_crypto::Cipher;
use otaru_storage::BlobStore;

use crate::chunkstore::{ChunkHeader, ChunkReader, ChunkWriter};
use crate::chunkstore::header::MAX_CHUNK_PAYLOAD_LEN;
use crate::error::{OtaruError, Result};

/// Blob paths with this prefix hold metadata rather than file content.
pub const METADATA_PREFIX: &str = "META_";
pub const VERSION_CACHE_BLOBPATH: &str = "META_VERSION_CACHE";

/// Upper bound of a decompressed snapshot, to refuse decompression bombs.
const MAX_SNAPSHOT_SIZE: u64 = 256 * 1024 * 1024;

pub fn is_metadata_blobpath(blobpath: &str) -> bool {
    blobpath.starts_with(METADATA_PREFIX)
}

/// Serialize `value` (MessagePack, zlib) into the chunk blob at `blobpath`.
pub fn save<T: Serialize + ?Sized>(
    blobpath: &str,
    store: &dyn BlobStore,
    cipher: &Cipher,
    value: &T,
) -> Result<()> {
    let mut zw = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    rmp_serde::encode::write_named(&mut zw, value)?;
    let compressed = zw
        .finish()
        .map_err(|e| OtaruError::Compression(format!("zlib: {e}")))?;
    if compressed.len() as i64 > MAX_CHUNK_PAYLOAD_LEN {
        return Err(OtaruError::PayloadTooLarge(compressed.len() as u64));
    }

    let header = ChunkHeader {
        payload_len: compressed.len() as u32,
        payload_version: 1,
        ..ChunkHeader::new(blobpath, 0)
    };
    let mut w = store.open_writer(blobpath)?;
    let mut cw = ChunkWriter::new(&mut w, cipher, &header)?;
    cw.write_all(&compressed).map_err(OtaruError::from_io)?;
    cw.finish()?;
    w.close()?;
    debug!(blobpath, bytes = compressed.len(), "saved state snapshot");
    Ok(())
}

/// Load a value written by [`save`].
pub fn restore<T: DeserializeOwned>(
    blobpath: &str,
    store: &dyn BlobStore,
    cipher: &Cipher,
) -> Result<T> {
    let r = store.open_reader(blobpath)?;
    let mut cr = ChunkReader::new(r, cipher)?;
    let mut compressed = Vec::with_capacity(cr.len());
    cr.read_to_end(&mut compressed)
        .map_err(OtaruError::from_io)?;

    let mut raw = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .take(MAX_SNAPSHOT_SIZE + 1)
        .read_to_end(&mut raw)
        .map_err(|e| OtaruError::Compression(format!("zlib: {e}")))?;
    if raw.len() as u64 > MAX_SNAPSHOT_SIZE {
        return Err(OtaruError::Compression(format!(
            "snapshot '{blobpath}' exceeds {MAX_SNAPSHOT_SIZE} bytes"
        )));
    }
    debug!(blobpath, bytes = raw.len(), "restored state snapshot");
    Ok(rmp_serde::from_slice(&raw)?)
}
