use rand::RngCore;
use std::fmt;

/// A random 16-byte blob identifier, rendered as 32 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobName(pub [u8; 16]);

impl BlobName {
    pub fn generate() -> Self {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        BlobName(buf)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a BlobName from a 32-character hex string.
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 16 {
            return Err(format!("expected 16 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(BlobName(arr))
    }
}

impl fmt::Debug for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobName({})", self.to_hex())
    }
}

impl fmt::Display for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
