//! Accounted allocator for descriptor lists, metadata blobs and intermediate
//! buffers.
//!
//! Every contiguous allocation the engine makes on behalf of a channel or a
//! request goes through [`ContigAllocator`]. The returned [`ContigBuf`] gives
//! its bytes back when dropped, so release happens on exactly one path by
//! construction. An optional byte limit models a bounded contiguous-memory
//! zone; exceeding it is the engine's resource-exhaustion condition.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::buf::{DmaBuf, DESCRIPTOR_ALIGNMENT};
use crate::error::{Error, Result};

/// Byte-limited allocator with live/total accounting.
#[derive(Debug)]
pub struct ContigAllocator {
    /// Maximum live bytes (`usize::MAX` = unlimited)
    limit: AtomicUsize,
    live_bytes: AtomicUsize,
    live_allocations: AtomicUsize,
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
    failed_allocations: AtomicU64,
}

impl ContigAllocator {
    /// Create an allocator with an optional byte limit.
    pub fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicUsize::new(limit.unwrap_or(usize::MAX)),
            live_bytes: AtomicUsize::new(0),
            live_allocations: AtomicUsize::new(0),
            total_allocations: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
        })
    }

    /// Create an allocator without a byte limit.
    pub fn unlimited() -> Arc<Self> {
        Self::new(None)
    }

    /// Change the byte limit. Existing allocations are unaffected.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.limit
            .store(limit.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    /// Current byte limit, if any.
    pub fn limit(&self) -> Option<usize> {
        match self.limit.load(Ordering::SeqCst) {
            usize::MAX => None,
            limit => Some(limit),
        }
    }

    /// Allocate `size` zeroed bytes aligned for descriptor use.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Result<ContigBuf> {
        self.reserve(size)?;

        match DmaBuf::with_alignment(size, DESCRIPTOR_ALIGNMENT) {
            Ok(buf) => {
                self.live_allocations.fetch_add(1, Ordering::SeqCst);
                self.total_allocations.fetch_add(1, Ordering::Relaxed);
                trace!(size, addr = buf.addr(), "contiguous allocation");
                Ok(ContigBuf {
                    buf,
                    owner: Arc::clone(self),
                })
            }
            Err(e) => {
                self.live_bytes.fetch_sub(size, Ordering::SeqCst);
                self.failed_allocations.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn reserve(&self, size: usize) -> Result<()> {
        let limit = self.limit.load(Ordering::SeqCst);
        let reserved =
            self.live_bytes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                    live.checked_add(size).filter(|&next| next <= limit)
                });

        reserved.map(|_| ()).map_err(|live| {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            Error::ResourceExhausted {
                size,
                reason: format!("contiguous memory limit reached ({} of {} bytes live)", live, limit),
            }
        })
    }

    fn release(&self, size: usize) {
        self.live_bytes.fetch_sub(size, Ordering::SeqCst);
        self.live_allocations.fetch_sub(1, Ordering::SeqCst);
        self.total_frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::SeqCst)
    }

    /// Bytes not yet released.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    /// Get a snapshot of allocator counters.
    pub fn snapshot(&self) -> AllocatorSnapshot {
        AllocatorSnapshot {
            live_bytes: self.live_bytes() as u64,
            live_allocations: self.live_allocations() as u64,
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorSnapshot {
    pub live_bytes: u64,
    pub live_allocations: u64,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub failed_allocations: u64,
}

/// One accounted contiguous allocation. Released to its allocator on drop.
#[derive(Debug)]
pub struct ContigBuf {
    buf: DmaBuf,
    owner: Arc<ContigAllocator>,
}

impl ContigBuf {
    /// Address of the first byte.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.buf.addr()
    }

    /// Read a little-endian `u32` at `offset`.
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    /// Read a little-endian `u64` at `offset`.
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Drop for ContigBuf {
    fn drop(&mut self) {
        trace!(size = self.buf.len(), addr = self.buf.addr(), "contiguous free");
        self.owner.release(self.buf.len());
    }
}

impl Deref for ContigBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for ContigBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_alloc_and_release_accounting() {
        let alloc = ContigAllocator::unlimited();
        let a = alloc.alloc(128).unwrap();
        let b = alloc.alloc(64).unwrap();
        assert_eq!(alloc.live_allocations(), 2);
        assert_eq!(alloc.live_bytes(), 192);

        drop(a);
        assert_eq!(alloc.live_allocations(), 1);
        assert_eq!(alloc.live_bytes(), 64);

        drop(b);
        let snap = alloc.snapshot();
        assert_eq!(snap.live_allocations, 0);
        assert_eq!(snap.total_allocations, 2);
        assert_eq!(snap.total_frees, 2);
    }

    #[test]
    fn test_limit_enforced() {
        let alloc = ContigAllocator::new(Some(100));
        let _a = alloc.alloc(80).unwrap();
        let result = alloc.alloc(40);
        assert_matches!(result, Err(Error::ResourceExhausted { size: 40, .. }));
        assert_eq!(alloc.live_bytes(), 80);
        assert_eq!(alloc.snapshot().failed_allocations, 1);
    }

    #[test]
    fn test_set_limit_at_runtime() {
        let alloc = ContigAllocator::unlimited();
        assert_eq!(alloc.limit(), None);
        alloc.set_limit(Some(0));
        assert!(alloc.alloc(1).is_err());
        alloc.set_limit(None);
        assert!(alloc.alloc(1).is_ok());
    }

    #[test]
    fn test_little_endian_accessors() {
        let alloc = ContigAllocator::unlimited();
        let mut buf = alloc.alloc(32).unwrap();
        buf.write_u32(0, 0xDEAD_BEEF);
        buf.write_u64(8, 0x0102_0304_0506_0708);
        assert_eq!(buf.read_u32(0), 0xDEAD_BEEF);
        assert_eq!(buf.read_u64(8), 0x0102_0304_0506_0708);
        assert_eq!(buf[0], 0xEF);
    }
}
