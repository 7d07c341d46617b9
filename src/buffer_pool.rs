//! Shared pool of fixed-size byte buffers
//!
//! Archive workers borrow a buffer for each file and give it back when the
//! [`PooledBuffer`] guard drops, whatever the outcome of that file was.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default buffer size (32 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug)]
struct Inner {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
    allocated: AtomicUsize,
}

/// Pool of reusable byte buffers, cheap to clone
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Create a pool of `buffer_size` buffers keeping at most `max_idle` spare
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::with_capacity(max_idle)),
                buffer_size: buffer_size.max(1),
                max_idle,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Borrow a buffer of `buffer_size` bytes; its contents are unspecified
    pub fn get(&self) -> PooledBuffer {
        let reused = self.inner.free.lock().pop();
        let buffer = reused.unwrap_or_else(|| {
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.inner.buffer_size]
        });
        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Size of each buffer
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Buffers waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Buffers allocated over the pool's lifetime
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

/// Buffer on loan from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<Inner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.max_idle {
                free.push(buffer);
            }
        }
    }
}
