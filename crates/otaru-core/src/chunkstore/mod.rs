//! Chunk blob format and the file-to-chunks mapping on top of it.

pub mod chunk_io;
pub mod chunked_file;
pub mod chunks_array;
pub mod header;
pub mod lock_manager;
pub mod stream;

pub use chunk_io::ChunkIo;
pub use chunked_file::{ChunkedFileIo, CHUNK_SPLIT_SIZE};
pub use chunks_array::{ChunksArrayIo, FileChunk, MemChunksArrayIo};
pub use header::ChunkHeader;
pub use lock_manager::{BlobLockGuard, LockManager};
pub use stream::{query_chunk_version, ChunkReader, ChunkVersionQuery, ChunkWriter};
