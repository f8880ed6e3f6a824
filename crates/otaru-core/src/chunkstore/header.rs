use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use otaru_crypto::{Cipher, FrameReader, FrameWriter, FRAME_OVERHEAD};
use otaru_types::BlobVersion;

use crate::error::{OtaruError, Result};

pub const SIGNATURE_MAGIC: [u8; 2] = [0x05, 0xa6];
pub const CURRENT_FORMAT: u8 = 0x03;
pub const CURRENT_FRAME_ENCAPSULATION: u8 = 0x02;

/// Bytes of clear-text prologue: the two magic bytes and the format byte.
pub const SIGNATURE_LENGTH: usize = SIGNATURE_MAGIC.len() + 1;
pub const CHUNK_HEADER_LENGTH: usize = 4096;
/// Plaintext size of the sealed header frame, zero padded.
pub const HEADER_FRAME_PAYLOAD_LENGTH: usize =
    CHUNK_HEADER_LENGTH - SIGNATURE_LENGTH - FRAME_OVERHEAD;

pub const MAX_CHUNK_PAYLOAD_LEN: i64 = i32::MAX as i64;
pub const MAX_ORIG_FILENAME_LEN: usize = 1024;

pub const UNKNOWN_ORIG_FILENAME: &str = "<unknown>";
const FILENAME_TOO_LONG: &str = "<filename_too_long>";

/// Authenticated metadata at the start of every chunk blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub frame_encapsulation: u8,
    pub payload_len: u32,
    pub payload_version: BlobVersion,
    pub orig_filename: String,
    pub orig_offset: i64,
}

impl Default for ChunkHeader {
    fn default() -> Self {
        Self::new(UNKNOWN_ORIG_FILENAME, -1)
    }
}

impl ChunkHeader {
    /// Header of a blob that has no content yet.
    pub fn new(orig_filename: &str, orig_offset: i64) -> Self {
        Self {
            frame_encapsulation: CURRENT_FRAME_ENCAPSULATION,
            payload_len: 0,
            payload_version: 0,
            orig_filename: orig_filename.to_string(),
            orig_offset,
        }
    }

    pub fn payload_len(&self) -> i64 {
        i64::from(self.payload_len)
    }

    /// Write the fixed-size header: clear-text prologue then one sealed frame.
    pub fn write_to<W: Write>(&self, w: &mut W, cipher: &Cipher) -> Result<()> {
        if self.payload_len() > MAX_CHUNK_PAYLOAD_LEN {
            return Err(OtaruError::PayloadTooLarge(u64::from(self.payload_len)));
        }
        let mut h = self.clone();
        h.frame_encapsulation = CURRENT_FRAME_ENCAPSULATION;
        h.orig_filename = clamp_orig_filename(&h.orig_filename);

        let mut encoded = rmp_serde::to_vec_named(&h)?;
        if encoded.len() > HEADER_FRAME_PAYLOAD_LENGTH {
            return Err(OtaruError::InvalidState(format!(
                "encoded chunk header is {} bytes, frame holds {HEADER_FRAME_PAYLOAD_LENGTH}",
                encoded.len()
            )));
        }
        encoded.resize(HEADER_FRAME_PAYLOAD_LENGTH, 0);

        w.write_all(&SIGNATURE_MAGIC)?;
        w.write_all(&[CURRENT_FORMAT])?;
        let mut fw = FrameWriter::new(w, cipher, HEADER_FRAME_PAYLOAD_LENGTH);
        fw.write_all(&encoded).map_err(OtaruError::from_io)?;
        fw.finish()?;
        Ok(())
    }

    /// Header bytes as written by [`ChunkHeader::write_to`].
    pub fn encode(&self, cipher: &Cipher) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_LENGTH);
        self.write_to(&mut buf, cipher)?;
        Ok(buf)
    }

    /// Read a header. Returns `None` if `r` is at end of stream before the
    /// first byte, which is how an empty blob presents itself.
    pub fn read_from<R: Read>(r: &mut R, cipher: &Cipher) -> Result<Option<Self>> {
        let mut prologue = [0u8; SIGNATURE_LENGTH];
        let first = loop {
            match r.read(&mut prologue[..1]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if first == 0 {
            return Ok(None);
        }
        r.read_exact(&mut prologue[1..])?;
        if prologue[..2] != SIGNATURE_MAGIC {
            return Err(OtaruError::BadMagic);
        }
        if prologue[2] != CURRENT_FORMAT {
            return Err(OtaruError::UnsupportedFormat(prologue[2]));
        }

        let mut fr = FrameReader::new(r, cipher, HEADER_FRAME_PAYLOAD_LENGTH);
        let mut encoded = vec![0u8; HEADER_FRAME_PAYLOAD_LENGTH];
        fr.read_exact(&mut encoded).map_err(OtaruError::from_io)?;
        if !fr.has_read_all() {
            return Err(OtaruError::InvalidState(
                "chunk header frame was not fully consumed".into(),
            ));
        }
        // The decoder stops at the end of the map; the zero padding is ignored.
        let h: ChunkHeader = rmp_serde::from_read(encoded.as_slice())?;
        Ok(Some(h))
    }
}

fn clamp_orig_filename(name: &str) -> String {
    if name.len() <= MAX_ORIG_FILENAME_LEN {
        return name.to_string();
    }
    let base = Path::new(name)
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !base.is_empty() && base.len() <= MAX_ORIG_FILENAME_LEN {
        base
    } else {
        FILENAME_TOO_LONG.to_string()
    }
}
