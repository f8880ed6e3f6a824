use std::fmt;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::pool::{BufferPool, PooledBuf};
use crate::{enc_frame_size, FRAME_MAX_PAYLOAD, FRAME_OVERHEAD, KEY_LEN, NONCE_LEN, TAG_LEN};
use otaru_types::error::{OtaruError, Result};

/// Buffers kept per pool. Beyond this, returned buffers are dropped.
const POOLED_BUFFERS: usize = 32;

/// AES-256-GCM frame sealer.
///
/// Every frame gets a fresh random nonce. The sealed layout is
/// `[12-byte nonce][ciphertext][16-byte tag]`, so a frame is always
/// [`FRAME_OVERHEAD`] bytes longer than its plaintext.
pub struct Cipher {
    aead: Aes256Gcm,
    frame_pool: BufferPool,
    payload_pool: BufferPool,
}

impl Cipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            frame_pool: BufferPool::new(enc_frame_size(FRAME_MAX_PAYLOAD), POOLED_BUFFERS),
            payload_pool: BufferPool::new(FRAME_MAX_PAYLOAD, POOLED_BUFFERS),
        }
    }

    /// Seal `plaintext` as one frame and append it to `dst`.
    pub fn encrypt_frame(&self, dst: &mut Vec<u8>, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > FRAME_MAX_PAYLOAD {
            return Err(OtaruError::PayloadTooLarge(plaintext.len() as u64));
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        dst.reserve(enc_frame_size(plaintext.len()));
        let start = dst.len();
        dst.extend_from_slice(&nonce_bytes);
        dst.extend_from_slice(plaintext);
        let tag = match self
            .aead
            .encrypt_in_place_detached(nonce, b"", &mut dst[start + NONCE_LEN..])
        {
            Ok(tag) => tag,
            Err(e) => {
                dst.truncate(start);
                return Err(OtaruError::Other(format!("AES-GCM encrypt: {e}")));
            }
        };
        dst.extend_from_slice(&tag);
        Ok(())
    }

    /// Open one sealed frame and append its plaintext to `dst`.
    ///
    /// On failure `dst` is left as it was.
    pub fn decrypt_frame(&self, dst: &mut Vec<u8>, frame: &[u8]) -> Result<()> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(OtaruError::DecryptionFailed);
        }
        let (nonce_bytes, ct_and_tag) = frame.split_at(NONCE_LEN);
        let (ciphertext, tag_bytes) = ct_and_tag.split_at(ct_and_tag.len() - TAG_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let tag = aes_gcm::Tag::from_slice(tag_bytes);

        let start = dst.len();
        dst.extend_from_slice(ciphertext);
        if self
            .aead
            .decrypt_in_place_detached(nonce, b"", &mut dst[start..], tag)
            .is_err()
        {
            dst.truncate(start);
            return Err(OtaruError::DecryptionFailed);
        }
        Ok(())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(enc_frame_size(plaintext.len()));
        self.encrypt_frame(&mut out, plaintext)?;
        Ok(out)
    }

    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(frame.len().saturating_sub(FRAME_OVERHEAD));
        self.decrypt_frame(&mut out, frame)?;
        Ok(out)
    }

    /// Scratch buffer sized for one sealed max-payload frame.
    pub fn frame_buf(&self) -> PooledBuf<'_> {
        self.frame_pool.get()
    }

    /// Scratch buffer sized for one max-payload plaintext frame.
    pub fn payload_buf(&self) -> PooledBuf<'_> {
        self.payload_pool.get()
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher(AES-256-GCM)")
    }
}
