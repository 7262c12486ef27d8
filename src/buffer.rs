//! Size-classed byte buffer cache
//!
//! Inbound payloads, reassembly buffers and outbound frames all pass through
//! short-lived byte buffers; recycling them through per-class free lists keeps
//! the hot path off the allocator. A [`PooledBuffer`] returns itself to the
//! pool when dropped, so release happens exactly once by construction.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Capacity classes, smallest to largest. Requests above the largest class
/// get a plain unpooled allocation.
const CLASSES: [usize; 8] = [
    128,
    1024,
    2 * 1024,
    4 * 1024,
    8 * 1024,
    16 * 1024,
    32 * 1024,
    64 * 1024,
];

/// Retained buffers per class
const SHARD_LIMIT: usize = 64;

static POOL: BufferPool = BufferPool::new();

/// Take a buffer with at least `size` bytes of capacity from the shared pool
pub(crate) fn alloc(size: usize) -> PooledBuffer {
    POOL.acquire(size)
}

/// Lock-striped free lists, one per capacity class
pub struct BufferPool {
    shards: [Mutex<Vec<Vec<u8>>>; CLASSES.len()],
}

impl BufferPool {
    const fn new() -> Self {
        Self {
            shards: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
        }
    }

    fn class_of(size: usize) -> Option<usize> {
        CLASSES.iter().position(|&cap| size <= cap)
    }

    fn acquire(&'static self, size: usize) -> PooledBuffer {
        match Self::class_of(size) {
            Some(class) => {
                let recycled = self.shards[class].lock().pop();
                let mut buf = recycled.unwrap_or_else(|| Vec::with_capacity(CLASSES[class]));
                buf.clear();
                PooledBuffer {
                    buf,
                    class: Some(class),
                }
            }
            None => PooledBuffer {
                buf: Vec::with_capacity(size),
                class: None,
            },
        }
    }

    fn release(&self, buf: Vec<u8>, class: usize) {
        let mut shard = self.shards[class].lock();
        if shard.len() < SHARD_LIMIT {
            shard.push(buf);
        }
    }

    #[cfg(test)]
    fn retained(&self, class: usize) -> usize {
        self.shards[class].lock().len()
    }
}

/// A byte buffer borrowed from the pool, handed back on drop.
///
/// Dereferences to `Vec<u8>`, so the usual byte-buffer operations apply.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    class: Option<usize>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    #[inline]
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            POOL.release(std::mem::take(&mut self.buf), class);
        }
    }
}
