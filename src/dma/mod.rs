//! Contiguous memory for accelerator I/O
//!
//! # Components
//!
//! - [`DmaBuf`] - aligned buffer with a stable address (data blocks)
//! - [`ContigAllocator`] / [`ContigBuf`] - accounted, byte-limited
//!   allocations for descriptor lists, metadata and intermediate buffers
//! - [`SpareBufferCache`] / [`SpareBuffer`] - block-sized overflow segments
//!   borrowed for each compression

pub mod alloc;
pub mod buf;
pub mod spare;

pub use alloc::{AllocatorSnapshot, ContigAllocator, ContigBuf};
pub use buf::{DmaBuf, DESCRIPTOR_ALIGNMENT, DMA_ALIGNMENT};
pub use spare::{SpareBuffer, SpareBufferCache};
