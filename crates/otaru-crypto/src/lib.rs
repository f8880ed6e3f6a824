pub mod cipher;
pub mod pool;
pub mod stream;

pub use cipher::Cipher;
pub use pool::{BufferPool, PooledBuf};
pub use stream::{FrameReader, FrameWriter};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes added to every sealed frame: `nonce || ciphertext || tag`.
pub const FRAME_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Plaintext size of every content frame except possibly the last one.
pub const FRAME_MAX_PAYLOAD: usize = 256 * 1024;

/// Sealed size of a frame carrying `payload_len` plaintext bytes.
pub const fn enc_frame_size(payload_len: usize) -> usize {
    payload_len + FRAME_OVERHEAD
}
