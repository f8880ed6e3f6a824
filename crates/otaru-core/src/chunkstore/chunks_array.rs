use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One region of a logical file, stored in its own blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub offset: i64,
    pub length: i64,
    pub blobpath: String,
}

impl FileChunk {
    pub fn left(&self) -> i64 {
        self.offset
    }

    pub fn right(&self) -> i64 {
        self.offset + self.length
    }
}

/// Access to a file's chunk list, kept sorted by offset and non-overlapping.
pub trait ChunksArrayIo: Send {
    fn read(&self) -> Result<Vec<FileChunk>>;
    fn write(&mut self, cs: &[FileChunk]) -> Result<()>;
}

/// Chunk list held in memory. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct MemChunksArrayIo {
    cs: Arc<Mutex<Vec<FileChunk>>>,
}

impl MemChunksArrayIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<FileChunk> {
        self.cs.lock().unwrap().clone()
    }
}

impl ChunksArrayIo for MemChunksArrayIo {
    fn read(&self) -> Result<Vec<FileChunk>> {
        Ok(self.chunks())
    }

    fn write(&mut self, cs: &[FileChunk]) -> Result<()> {
        *self.cs.lock().unwrap() = cs.to_vec();
        Ok(())
    }
}
