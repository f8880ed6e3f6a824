use thiserror::Error;

pub type Result<T> = std::result::Result<T, OtaruError>;

#[derive(Debug, Error)]
pub enum OtaruError {
    #[error("blob not found: '{0}'")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("decryption failed: wrong key or corrupted frame")]
    DecryptionFailed,

    #[error("chunk header magic mismatch")]
    BadMagic,

    #[error("unsupported chunk header format: {0}")]
    UnsupportedFormat(u8),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(u64),

    #[error("read out of bounds: offset {offset} len {len} exceeds payload length {payload_len}")]
    OutOfBounds {
        offset: i64,
        len: usize,
        payload_len: i64,
    },

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(i64),

    #[error("cache invalidation failed for '{0}'")]
    InvalidateFailed(String),

    #[error("too many open cache entries")]
    TooManyOpenFiles,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl OtaruError {
    /// True for both the explicit `NotFound` variant and an I/O error of kind
    /// `NotFound` surfaced by a filesystem-backed store.
    pub fn is_not_found(&self) -> bool {
        match self {
            OtaruError::NotFound(_) => true,
            OtaruError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Convert into a `std::io::Error` so the error can cross a `Read`/`Write` boundary.
    pub fn into_io(self) -> std::io::Error {
        match self {
            OtaruError::Io(e) => e,
            OtaruError::NotFound(p) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("blob not found: '{p}'"))
            }
            other => std::io::Error::other(other),
        }
    }

    /// Inverse of [`OtaruError::into_io`]: recover the original error if one was wrapped.
    pub fn from_io(e: std::io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<OtaruError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(err) = inner.downcast::<OtaruError>() {
                    return *err;
                }
            }
            return OtaruError::Other("unwrappable I/O error".into());
        }
        OtaruError::Io(e)
    }
}
