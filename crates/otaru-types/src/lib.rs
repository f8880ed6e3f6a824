pub mod blob_name;
pub mod error;
pub mod flags;

/// Monotonic payload version carried in a chunk header.
///
/// `0` means "blob absent or never written".
pub type BlobVersion = i64;
