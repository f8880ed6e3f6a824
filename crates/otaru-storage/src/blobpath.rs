use otaru_types::blob_name::BlobName;
use otaru_types::error::{OtaruError, Result};
use otaru_types::flags::OpenFlags;

use crate::{BlobHandle, RandomAccessBlobStore};

const MAX_TRIALS: usize = 256;

/// Pick a random blob path that is unused in `store`.
///
/// An existing but empty blob counts as unused. Under heavy contention two
/// callers may still be handed the same path.
pub fn generate_new_blob_path(store: &dyn RandomAccessBlobStore) -> Result<String> {
    for _ in 0..MAX_TRIALS {
        let candidate = BlobName::generate().to_hex();
        let mut handle = match store.open(&candidate, OpenFlags::RDONLY) {
            Ok(h) => h,
            Err(e) if e.is_not_found() => return Ok(candidate),
            Err(e) => return Err(e),
        };
        let unused = handle.size()? == 0;
        handle.close()?;
        if unused {
            return Ok(candidate);
        }
    }
    Err(OtaruError::Other(format!(
        "failed to generate a unique blob path within {MAX_TRIALS} trials"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBlobStore;

    #[test]
    fn generated_paths_are_hex_and_distinct() {
        let store = MemBlobStore::new();
        let a = generate_new_blob_path(&store).unwrap();
        let b = generate_new_blob_path(&store).unwrap();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn generated_path_is_not_in_store() {
        let store = MemBlobStore::new();
        for i in 0..8 {
            store.put(&format!("blob{i}"), b"taken");
        }
        let path = generate_new_blob_path(&store).unwrap();
        assert!(store.get(&path).is_none());
    }
}
