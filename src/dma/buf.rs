//! Aligned, physically-contiguous-per-allocation buffers
//!
//! Accelerators read descriptors and data through addresses, not slices, so
//! every buffer handed to a channel must have a stable address for as long as
//! a job may touch it. `DmaBuf` owns one aligned heap allocation that never
//! moves, even when the owning value does.
//!
//! # Example
//!
//! ```ignore
//! use dedupe_offload::dma::DmaBuf;
//!
//! let mut buf = DmaBuf::new(4096)?;
//! buf[0..4].copy_from_slice(&[1, 2, 3, 4]);
//! let addr = buf.addr();
//! ```

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::error::{Error, Result};

/// Default DMA alignment (4KB page)
pub const DMA_ALIGNMENT: usize = 4096;

/// Alignment for descriptor lists and metadata blobs
pub const DESCRIPTOR_ALIGNMENT: usize = 64;

/// Zero-initialized, aligned heap buffer with a stable address.
///
/// # Memory Safety
///
/// - The buffer is freed exactly once, when dropped
/// - The pointer is non-null (checked at allocation)
/// - Moving a `DmaBuf` does not move the memory it owns
#[derive(Debug)]
pub struct DmaBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: DmaBuf owns its memory exclusively; access goes through &self/&mut self.
unsafe impl Send for DmaBuf {}
unsafe impl Sync for DmaBuf {}

impl DmaBuf {
    /// Allocate a zeroed buffer aligned to [`DMA_ALIGNMENT`].
    pub fn new(size: usize) -> Result<Self> {
        Self::with_alignment(size, DMA_ALIGNMENT)
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut buf = Self::new(data.len())?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    /// Allocate a zeroed buffer with an explicit alignment.
    pub fn with_alignment(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::ResourceExhausted {
                size,
                reason: "size must be greater than 0".into(),
            });
        }

        let layout =
            Layout::from_size_align(size, align).map_err(|e| Error::ResourceExhausted {
                size,
                reason: format!("invalid layout: {}", e),
            })?;

        // SAFETY: layout has non-zero size and a valid power-of-two alignment
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).map_or_else(
            || {
                Err(Error::ResourceExhausted {
                    size,
                    reason: "allocation failed".into(),
                })
            },
            |ptr| Ok(Self { ptr, size, layout }),
        )
    }

    /// Returns the size of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always `false` for a constructed buffer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Address of the first byte, as written into hardware descriptors.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Check if the buffer pointer honours its requested alignment.
    #[inline]
    pub fn is_aligned(&self) -> bool {
        (self.ptr.as_ptr() as usize) % self.layout.align() == 0
    }

    /// Fill the entire buffer with a byte value.
    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    /// Copy data from a slice into the front of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() > self.len()`.
    pub fn copy_from_slice(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.size,
            "source slice too large: {} > {}",
            data.len(),
            self.size
        );
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for self.size bytes and we hold a shared borrow
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for self.size bytes and we hold an exclusive borrow
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout and is freed only here
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl Deref for DmaBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for DmaBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for DmaBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DmaBuf {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}
