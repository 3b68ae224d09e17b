//! Scatter/Gather Builder
//!
//! Turns logical `(address, length)` buffers into the descriptor lists an
//! accelerator channel consumes. Each list is two accounted allocations:
//!
//! ```text
//! list memory (ContigBuf)                          metadata (ContigBuf)
//! ┌──────────────────────────────────────┐         ┌──────────────────┐
//! │ header (32 bytes)                    │         │ opaque, sized by │
//! │   num_buffers  u32                   │         │ the accelerator  │
//! │   reserved     u32                   │  ─────▶ │ for num_buffers  │
//! │   buffers      u64 ─┐                │         └──────────────────┘
//! │   user_data    u64  │                │
//! │   private_meta u64 ─┼────────────────┘
//! ├─────────────────────▼────────────────┤
//! │ flat buffer 0 { len u32, rsvd u32, data u64 }
//! │ flat buffer 1 ...                    │
//! │ ... capacity = (L >> page_shift) + 2 │
//! └──────────────────────────────────────┘
//! ```
//!
//! Dropping a [`ScatterGatherList`] releases both allocations. A request
//! whose second list cannot be built drops the first on the way out, so a
//! failed build never leaks.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::accel::Accelerator;
use crate::dma::{ContigAllocator, ContigBuf};
use crate::error::{Error, Result};

/// Size of the list header preceding the descriptor array.
pub const BUFFER_LIST_HEADER_SIZE: usize = 32;

/// Size of one flat-buffer descriptor.
pub const FLAT_BUFFER_SIZE: usize = 16;

const OFF_NUM_BUFFERS: usize = 0;
const OFF_BUFFERS: usize = 8;
const OFF_USER_DATA: usize = 16;
const OFF_PRIVATE_META: usize = 24;

const FLAT_OFF_LEN: usize = 0;
const FLAT_OFF_DATA: usize = 8;

/// Worst-case segment count for a buffer of `len` bytes. The extra two
/// cover a buffer that starts and ends part-way through a page.
pub fn segment_estimate(len: usize, page_shift: u32) -> usize {
    (len >> page_shift) + 2
}

// =============================================================================
// FlatBuffer
// =============================================================================

/// One `(address, length)` segment.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FlatBuffer {
    addr: u64,
    len: usize,
}

impl FlatBuffer {
    pub fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }

    /// Segment covering `buf`. The caller keeps `buf` alive and unborrowed
    /// for as long as the descriptor may be dereferenced.
    pub fn from_slice(buf: &mut [u8]) -> Self {
        Self {
            addr: buf.as_mut_ptr() as u64,
            len: buf.len(),
        }
    }

    pub fn empty() -> Self {
        Self { addr: 0, len: 0 }
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Move the start of the segment forward by `n` bytes.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if n > self.len {
            return Err(Error::Internal(format!(
                "cannot advance segment of {} bytes by {}",
                self.len, n
            )));
        }
        self.addr += n as u64;
        self.len -= n;
        Ok(())
    }

    /// View the segment's bytes.
    ///
    /// # Safety
    ///
    /// The memory behind `addr` must be live for `len` bytes and not
    /// mutably aliased for the lifetime of the returned slice.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.addr as *const u8, self.len)
    }

    /// Mutable view of the segment's bytes.
    ///
    /// # Safety
    ///
    /// The memory behind `addr` must be live for `len` bytes and not
    /// aliased at all for the lifetime of the returned slice.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.addr as *mut u8, self.len)
    }
}

impl fmt::Debug for FlatBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlatBuffer({:#x}, {})", self.addr, self.len)
    }
}

// =============================================================================
// ScatterGatherList
// =============================================================================

/// Descriptor list plus its hardware metadata blob.
pub struct ScatterGatherList {
    list: ContigBuf,
    metadata: Option<ContigBuf>,
    capacity: usize,
}

impl ScatterGatherList {
    fn new(list: ContigBuf, metadata: Option<ContigBuf>, capacity: usize) -> Self {
        let mut sgl = Self {
            list,
            metadata,
            capacity,
        };
        let buffers = sgl.list.addr() + BUFFER_LIST_HEADER_SIZE as u64;
        let meta = sgl.metadata.as_ref().map_or(0, |m| m.addr());
        sgl.list.write_u32(OFF_NUM_BUFFERS, 0);
        sgl.list.write_u64(OFF_BUFFERS, buffers);
        sgl.list.write_u64(OFF_USER_DATA, 0);
        sgl.list.write_u64(OFF_PRIVATE_META, meta);
        sgl
    }

    /// Address of the list header, as handed to the accelerator.
    pub fn addr(&self) -> u64 {
        self.list.addr()
    }

    /// Address of the metadata blob (0 when the accelerator needs none).
    pub fn metadata_addr(&self) -> u64 {
        self.list.read_u64(OFF_PRIVATE_META)
    }

    pub fn metadata_len(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.len())
    }

    /// Number of segments in use.
    pub fn num_buffers(&self) -> usize {
        self.list.read_u32(OFF_NUM_BUFFERS) as usize
    }

    /// Number of descriptor slots allocated.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot(i: usize) -> usize {
        BUFFER_LIST_HEADER_SIZE + i * FLAT_BUFFER_SIZE
    }

    /// Read descriptor `i`.
    pub fn segment(&self, i: usize) -> Option<FlatBuffer> {
        if i >= self.num_buffers() {
            return None;
        }
        let off = Self::slot(i);
        Some(FlatBuffer {
            len: self.list.read_u32(off + FLAT_OFF_LEN) as usize,
            addr: self.list.read_u64(off + FLAT_OFF_DATA),
        })
    }

    /// All segments in order.
    pub fn segments(&self) -> impl Iterator<Item = FlatBuffer> + '_ {
        (0..self.num_buffers()).filter_map(move |i| self.segment(i))
    }

    /// Total bytes described by the list.
    pub fn total_len(&self) -> usize {
        self.segments().map(|s| s.len()).sum()
    }

    fn write_segment(&mut self, i: usize, seg: FlatBuffer) -> Result<()> {
        let len = u32::try_from(seg.len).map_err(|_| {
            Error::Internal(format!("segment of {} bytes exceeds descriptor range", seg.len))
        })?;
        let off = Self::slot(i);
        self.list.write_u32(off + FLAT_OFF_LEN, len);
        self.list.write_u64(off + FLAT_OFF_DATA, seg.addr);
        Ok(())
    }

    /// Append a segment.
    pub fn push(&mut self, seg: FlatBuffer) -> Result<()> {
        let n = self.num_buffers();
        if n >= self.capacity {
            return Err(Error::Internal(format!(
                "scatter/gather list full ({} segments)",
                self.capacity
            )));
        }
        self.write_segment(n, seg)?;
        self.list.write_u32(OFF_NUM_BUFFERS, (n + 1) as u32);
        Ok(())
    }

    /// Skip `n` bytes at the front of the first segment.
    pub fn advance_first(&mut self, n: usize) -> Result<()> {
        let mut first = self
            .segment(0)
            .ok_or_else(|| Error::Internal("advance on empty scatter/gather list".into()))?;
        first.advance(n)?;
        self.write_segment(0, first)
    }
}

impl fmt::Debug for ScatterGatherList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScatterGatherList")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("capacity", &self.capacity)
            .field("segments", &self.segments().collect::<Vec<_>>())
            .field("metadata_len", &self.metadata_len())
            .finish()
    }
}

// =============================================================================
// IntermediateBuffer
// =============================================================================

/// Per-channel hardware scratch: a one-segment list over its own data buffer.
#[derive(Debug)]
pub struct IntermediateBuffer {
    list: ScatterGatherList,
    data: ContigBuf,
}

impl IntermediateBuffer {
    pub fn list(&self) -> &ScatterGatherList {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds lists for one accelerator channel.
pub struct SgListBuilder<'a> {
    allocator: &'a Arc<ContigAllocator>,
    accel: &'a dyn Accelerator,
    instance: usize,
}

impl<'a> SgListBuilder<'a> {
    pub fn new(
        allocator: &'a Arc<ContigAllocator>,
        accel: &'a dyn Accelerator,
        instance: usize,
    ) -> Self {
        Self {
            allocator,
            accel,
            instance,
        }
    }

    /// Allocate an empty list with room for `num_buffers` segments and the
    /// metadata blob the accelerator asks for.
    pub fn build(&self, num_buffers: usize) -> Result<ScatterGatherList> {
        let meta_size = self
            .accel
            .buffer_list_meta_size(self.instance, num_buffers)
            .map_err(|status| Error::accel("buffer_list_meta_size", status))?;

        let metadata = if meta_size > 0 {
            Some(self.allocator.alloc(meta_size)?)
        } else {
            None
        };
        let list = self
            .allocator
            .alloc(BUFFER_LIST_HEADER_SIZE + num_buffers * FLAT_BUFFER_SIZE)?;

        trace!(instance = self.instance, num_buffers, meta_size, "built scatter/gather list");
        Ok(ScatterGatherList::new(list, metadata, num_buffers))
    }

    /// Build source and destination lists for one request. `source` and
    /// `destination` are the segment sets; capacities are the worst-case
    /// estimates for each side.
    ///
    /// Fails with nothing left allocated if either side cannot be built.
    pub fn build_pair(
        &self,
        source: &[FlatBuffer],
        source_capacity: usize,
        destination: &[FlatBuffer],
        destination_capacity: usize,
    ) -> Result<(ScatterGatherList, ScatterGatherList)> {
        let mut src = self.build(source_capacity)?;
        for seg in source {
            src.push(*seg)?;
        }

        let mut dst = self.build(destination_capacity)?;
        for seg in destination {
            dst.push(*seg)?;
        }

        Ok((src, dst))
    }

    /// Allocate one intermediate buffer of `size` bytes.
    pub fn intermediate(&self, size: usize) -> Result<IntermediateBuffer> {
        let mut list = self.build(1)?;
        let mut data = self.allocator.alloc(size)?;
        list.push(FlatBuffer::from_slice(&mut data))?;
        Ok(IntermediateBuffer { list, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::emulated::{EmulatedAccelerator, EmulatedConfig};
    use assert_matches::assert_matches;

    fn accel() -> EmulatedAccelerator {
        EmulatedAccelerator::new(EmulatedConfig {
            instances: 1,
            ..Default::default()
        })
    }

    #[test]
    fn test_segment_estimate() {
        assert_eq!(segment_estimate(4096, 12), 3);
        assert_eq!(segment_estimate(4095, 12), 2);
        assert_eq!(segment_estimate(131072, 12), 34);
        assert_eq!(segment_estimate(0, 12), 2);
    }

    #[test]
    fn test_flat_buffer_advance() {
        let mut data = vec![0u8; 16];
        let mut fb = FlatBuffer::from_slice(&mut data);
        let base = fb.addr();
        fb.advance(2).unwrap();
        assert_eq!(fb.addr(), base + 2);
        assert_eq!(fb.len(), 14);
        assert!(fb.advance(15).is_err());
    }

    #[test]
    fn test_build_list_layout() {
        let accel = accel();
        let alloc = ContigAllocator::unlimited();
        let builder = SgListBuilder::new(&alloc, &accel, 0);

        let mut data = vec![0xABu8; 4096];
        let mut list = builder.build(3).unwrap();
        assert_eq!(list.capacity(), 3);
        assert_eq!(list.num_buffers(), 0);
        assert_ne!(list.metadata_addr(), 0);

        list.push(FlatBuffer::from_slice(&mut data)).unwrap();
        assert_eq!(list.num_buffers(), 1);
        assert_eq!(list.total_len(), 4096);
        assert_eq!(list.segment(0).unwrap().addr(), data.as_ptr() as u64);
        assert!(list.segment(1).is_none());

        list.advance_first(2).unwrap();
        assert_eq!(list.segment(0).unwrap().len(), 4094);
    }

    #[test]
    fn test_list_capacity_enforced() {
        let accel = accel();
        let alloc = ContigAllocator::unlimited();
        let builder = SgListBuilder::new(&alloc, &accel, 0);

        let mut a = vec![0u8; 8];
        let mut list = builder.build(1).unwrap();
        list.push(FlatBuffer::from_slice(&mut a)).unwrap();
        assert_matches!(list.push(FlatBuffer::from_slice(&mut a)), Err(Error::Internal(_)));
    }

    #[test]
    fn test_drop_releases_both_allocations() {
        let accel = accel();
        let alloc = ContigAllocator::unlimited();
        let builder = SgListBuilder::new(&alloc, &accel, 0);

        let list = builder.build(4).unwrap();
        assert_eq!(alloc.live_allocations(), 2);
        drop(list);
        assert_eq!(alloc.live_allocations(), 0);
        assert_eq!(alloc.live_bytes(), 0);
    }

    #[test]
    fn test_build_pair_failure_releases_first_side() {
        let accel = accel();
        let alloc = ContigAllocator::unlimited();
        let builder = SgListBuilder::new(&alloc, &accel, 0);

        // Enough for exactly one list (metadata + list header + 3 slots)
        let one_side = accel.buffer_list_meta_size(0, 3).unwrap()
            + BUFFER_LIST_HEADER_SIZE
            + 3 * FLAT_BUFFER_SIZE;
        alloc.set_limit(Some(one_side + 8));

        let mut src = vec![0u8; 4096];
        let mut dst = vec![0u8; 4096];
        let result = builder.build_pair(
            &[FlatBuffer::from_slice(&mut src)],
            3,
            &[FlatBuffer::from_slice(&mut dst)],
            3,
        );

        assert_matches!(result, Err(Error::ResourceExhausted { .. }));
        assert_eq!(alloc.live_allocations(), 0);
        assert_eq!(alloc.live_bytes(), 0);
    }

    #[test]
    fn test_intermediate_buffer() {
        let accel = accel();
        let alloc = ContigAllocator::unlimited();
        let builder = SgListBuilder::new(&alloc, &accel, 0);

        let buf = builder.intermediate(2 * 131072).unwrap();
        assert_eq!(buf.len(), 262144);
        assert_eq!(buf.list().num_buffers(), 1);
        assert_eq!(buf.list().total_len(), 262144);
        assert_eq!(alloc.live_allocations(), 3);
        drop(buf);
        assert_eq!(alloc.live_allocations(), 0);
    }
}
