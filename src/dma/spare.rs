//! Spare buffer cache
//!
//! During compression the destination list carries one extra block-sized
//! segment after the primary output so that incompressible input overflows
//! into scratch space instead of making the accelerator report an overflow.
//! These spare blocks come from a dedicated, pre-sized object cache.
//!
//! A [`SpareBuffer`] returns itself to its cache when dropped, so every
//! borrow is given back exactly once regardless of which completion branch
//! runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::buf::DmaBuf;
use crate::error::{Error, Result};
use crate::sgl::FlatBuffer;

#[derive(Debug)]
struct CacheInner {
    name: &'static str,
    /// Available buffers
    buffers: Mutex<Vec<DmaBuf>>,
    /// Size of each buffer
    buffer_size: usize,
    /// Maximum number of idle buffers kept
    max_capacity: usize,
    /// Buffers currently borrowed
    outstanding: AtomicUsize,
    destroyed: AtomicBool,
}

impl CacheInner {
    fn put(&self, buf: DmaBuf) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_capacity {
            buffers.push(buf);
        }
        // else: buffer is dropped
    }
}

/// A cache of block-sized scratch buffers.
#[derive(Debug, Clone)]
pub struct SpareBufferCache {
    inner: Arc<CacheInner>,
}

impl SpareBufferCache {
    /// Create an empty cache of `buffer_size` objects.
    pub fn with_capacity(name: &'static str, buffer_size: usize, max_capacity: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name,
                buffers: Mutex::new(Vec::with_capacity(max_capacity)),
                buffer_size,
                max_capacity,
                outstanding: AtomicUsize::new(0),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a cache of `buffer_size` objects.
    ///
    /// # Arguments
    ///
    /// * `name` - Name used in logs
    /// * `buffer_size` - Size of each buffer (one storage block)
    /// * `initial_count` - Number of buffers to pre-allocate
    /// * `max_capacity` - Maximum number of idle buffers to keep
    pub fn new(
        name: &'static str,
        buffer_size: usize,
        initial_count: usize,
        max_capacity: usize,
    ) -> Result<Self> {
        let cache = Self::with_capacity(name, buffer_size, max_capacity.max(initial_count));
        {
            let mut buffers = cache.inner.buffers.lock();
            for _ in 0..initial_count {
                buffers.push(DmaBuf::new(buffer_size)?);
            }
        }

        debug!(name, buffer_size, initial_count, max_capacity, "created spare buffer cache");
        Ok(cache)
    }

    /// Borrow a buffer, allocating a new one if the cache is empty.
    pub fn get(&self) -> Result<SpareBuffer> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::ResourceExhausted {
                size: self.inner.buffer_size,
                reason: format!("{} has been destroyed", self.inner.name),
            });
        }

        let pooled = self.inner.buffers.lock().pop();
        let buf = match pooled {
            Some(buf) => buf,
            None => DmaBuf::new(self.inner.buffer_size)?,
        };

        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(SpareBuffer {
            buf: Some(buf),
            cache: Arc::clone(&self.inner),
        })
    }

    /// Free every idle buffer and refuse further borrows. Buffers still out
    /// are freed when they come back.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let freed = {
            let mut buffers = self.inner.buffers.lock();
            let n = buffers.len();
            buffers.clear();
            n
        };
        debug!(name = self.inner.name, freed, "destroyed spare buffer cache");
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Returns the number of idle buffers in the cache.
    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    /// Returns the number of borrowed buffers not yet returned.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Returns the size of buffers in this cache.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

/// A borrowed spare block. Goes back to its cache on drop.
#[derive(Debug)]
pub struct SpareBuffer {
    buf: Option<DmaBuf>,
    cache: Arc<CacheInner>,
}

impl SpareBuffer {
    /// Descriptor covering the whole buffer.
    pub fn segment(&mut self) -> FlatBuffer {
        match self.buf.as_mut() {
            Some(buf) => FlatBuffer::from_slice(buf.as_mut_slice()),
            None => FlatBuffer::empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SpareBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.cache.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_return() {
        let cache = SpareBufferCache::new("test_spare", 4096, 2, 4).unwrap();
        assert_eq!(cache.available(), 2);

        let a = cache.get().unwrap();
        let b = cache.get().unwrap();
        let c = cache.get().unwrap();
        assert_eq!(cache.available(), 0);
        assert_eq!(cache.outstanding(), 3);
        assert_eq!(a.len(), 4096);

        drop(a);
        drop(b);
        drop(c);
        assert_eq!(cache.outstanding(), 0);
        assert_eq!(cache.available(), 3);
    }

    #[test]
    fn test_capacity_bound() {
        let cache = SpareBufferCache::new("test_spare", 512, 0, 1).unwrap();
        let a = cache.get().unwrap();
        let b = cache.get().unwrap();
        drop(a);
        drop(b);
        assert_eq!(cache.available(), 1);
    }

    #[test]
    fn test_destroy_with_outstanding() {
        let cache = SpareBufferCache::new("test_spare", 512, 2, 2).unwrap();
        let held = cache.get().unwrap();
        cache.destroy();
        assert!(cache.is_destroyed());
        assert_eq!(cache.available(), 0);
        assert!(cache.get().is_err());

        drop(held);
        assert_eq!(cache.outstanding(), 0);
        assert_eq!(cache.available(), 0);
    }

    #[test]
    fn test_segment_covers_buffer() {
        let cache = SpareBufferCache::new("test_spare", 4096, 1, 1).unwrap();
        let mut spare = cache.get().unwrap();
        let seg = spare.segment();
        assert_eq!(seg.len(), 4096);
        assert_ne!(seg.addr(), 0);
    }
}
