use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Thread-safe free list of byte buffers for the frame hot path.
///
/// [`BufferPool::get`] hands out a cleared buffer with at least
/// `buf_capacity` bytes reserved; dropping the [`PooledBuf`] returns it.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buf_capacity: usize, max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_capacity,
            max_pooled,
        }
    }

    pub fn get(&self) -> PooledBuf<'_> {
        let buf = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_capacity));
        PooledBuf { pool: self, buf }
    }

    fn put(&self, mut buf: Vec<u8>) {
        // Detached buffers come back empty and unallocated.
        if buf.capacity() < self.buf_capacity || buf.capacity() == 0 {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// RAII buffer checked out of a [`BufferPool`].
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl PooledBuf<'_> {
    /// Take ownership of the buffer; it will not return to the pool.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn buffers_return_on_drop() {
        let pool = BufferPool::new(64, 4);
        {
            let mut a = pool.get();
            a.extend_from_slice(b"hello");
            let _b = pool.get();
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 64);
    }

    #[test]
    fn into_inner_detaches() {
        let pool = BufferPool::new(16, 4);
        let mut buf = pool.get();
        buf.push(7);
        let owned = buf.into_inner();
        assert_eq!(owned, vec![7]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_is_capped() {
        let pool = BufferPool::new(8, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn concurrent_get_put() {
        let pool = Arc::new(BufferPool::new(128, 8));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        let mut buf = pool.get();
                        buf.push(i as u8);
                        assert_eq!(buf.len(), 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle() <= 8);
    }
}
