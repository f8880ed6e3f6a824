use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// Per-blob exclusive locks.
///
/// Chunk I/O holds the lock of the blob it touches for the duration of a
/// single read or write, so two file handles never interleave frame updates.
#[derive(Debug, Default)]
pub struct LockManager {
    locked: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `blobpath` is free, then take it.
    pub fn lock(&self, blobpath: &str) -> BlobLockGuard<'_> {
        let mut locked = self.locked.lock().unwrap();
        while locked.contains(blobpath) {
            locked = self.released.wait(locked).unwrap();
        }
        locked.insert(blobpath.to_string());
        BlobLockGuard {
            manager: self,
            blobpath: blobpath.to_string(),
        }
    }

    fn unlock(&self, blobpath: &str) {
        let mut locked = self.locked.lock().unwrap();
        locked.remove(blobpath);
        self.released.notify_all();
    }

    pub fn is_locked(&self, blobpath: &str) -> bool {
        self.locked.lock().unwrap().contains(blobpath)
    }
}

/// Releases the blob lock on drop.
pub struct BlobLockGuard<'a> {
    manager: &'a LockManager,
    blobpath: String,
}

impl Drop for BlobLockGuard<'_> {
    fn drop(&mut self) {
        self.manager.unlock(&self.blobpath);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn guard_releases_on_drop() {
        let lm = LockManager::new();
        {
            let _g = lm.lock("a");
            assert!(lm.is_locked("a"));
            assert!(!lm.is_locked("b"));
            let _h = lm.lock("b");
        }
        assert!(!lm.is_locked("a"));
        assert!(!lm.is_locked("b"));
    }

    #[test]
    fn same_path_is_exclusive() {
        let lm = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lm = Arc::clone(&lm);
                let inside = Arc::clone(&inside);
                let entered = Arc::clone(&entered);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10 {
                        let _g = lm.lock("shared");
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        thread::sleep(Duration::from_micros(200));
                        inside.store(false, Ordering::SeqCst);
                        entered.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 40);
    }
}
