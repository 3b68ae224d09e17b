//! Per-block I/O context
//!
//! A [`DataVio`] carries one block through the offload engine: the data to
//! compress (or the stored compressed block to read), a scratch block for
//! the accelerator's output, the result fields the completion fills in, and
//! the [`Continuation`] that hands it back to the I/O pipeline.
//!
//! The context is moved into the request at submission and moved out again
//! at completion, so the pipeline can only ever see it once.

use std::fmt;
use std::ops::Range;

use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::dma::DmaBuf;
use crate::error::{Error, Result};

/// Where a finished context goes next.
pub enum Continuation {
    /// Push onto a pipeline work queue
    Queue(mpsc::UnboundedSender<DataVio>),
    /// Wake a single waiter
    Oneshot(oneshot::Sender<DataVio>),
    /// Run a closure on the completing thread
    Callback(Box<dyn FnOnce(DataVio) + Send>),
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Queue(_) => f.write_str("Continuation::Queue"),
            Continuation::Oneshot(_) => f.write_str("Continuation::Oneshot"),
            Continuation::Callback(_) => f.write_str("Continuation::Callback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioOperation {
    Write,
    Read,
}

/// Where the compressed bytes of a write live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedData {
    None,
    ScratchBlock,
}

/// Compression outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionState {
    /// Envelope length, or `block_size + 1` when incompressible
    pub size: usize,
    pub data: CompressedData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Pending,
    Success,
    InvalidFragment,
}

/// Where the decoded bytes of a read live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadData {
    None,
    ScratchBlock,
}

/// Decompression outcome of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock {
    pub status: ReadStatus,
    pub data: ReadData,
    pub length: usize,
}

/// One block's I/O context.
pub struct DataVio {
    id: u64,
    operation: VioOperation,
    block_size: usize,
    data_block: DmaBuf,
    scratch_block: DmaBuf,
    fragment: Range<usize>,
    compression: CompressionState,
    read_block: ReadBlock,
    continuation: Option<Continuation>,
}

impl DataVio {
    /// Context for compressing `data`. The block size is the data length.
    pub fn for_write(id: u64, data: DmaBuf, continuation: Continuation) -> Result<Self> {
        let block_size = data.len();
        let scratch_block = DmaBuf::new(block_size)?;
        Ok(Self {
            id,
            operation: VioOperation::Write,
            block_size,
            fragment: 0..block_size,
            data_block: data,
            scratch_block,
            compression: CompressionState {
                size: 0,
                data: CompressedData::None,
            },
            read_block: ReadBlock {
                status: ReadStatus::Pending,
                data: ReadData::None,
                length: 0,
            },
            continuation: Some(continuation),
        })
    }

    /// Context for decoding the envelope at `fragment` inside `stored` into
    /// a `block_size` scratch block.
    pub fn for_read(
        id: u64,
        stored: DmaBuf,
        fragment: Range<usize>,
        block_size: usize,
        continuation: Continuation,
    ) -> Result<Self> {
        if fragment.start > fragment.end || fragment.end > stored.len() {
            return Err(Error::InvalidFragment(format!(
                "fragment {:?} outside stored block of {} bytes",
                fragment,
                stored.len()
            )));
        }
        let scratch_block = DmaBuf::new(block_size)?;
        Ok(Self {
            id,
            operation: VioOperation::Read,
            block_size,
            data_block: stored,
            scratch_block,
            fragment,
            compression: CompressionState {
                size: 0,
                data: CompressedData::None,
            },
            read_block: ReadBlock {
                status: ReadStatus::Pending,
                data: ReadData::None,
                length: 0,
            },
            continuation: Some(continuation),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn operation(&self) -> VioOperation {
        self.operation
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Size reported for a block that did not compress.
    #[inline]
    pub fn incompressible_size(&self) -> usize {
        self.block_size + 1
    }

    pub fn data_block(&self) -> &[u8] {
        &self.data_block
    }

    pub fn data_block_mut(&mut self) -> &mut DmaBuf {
        &mut self.data_block
    }

    pub fn scratch_block(&self) -> &[u8] {
        &self.scratch_block
    }

    pub fn scratch_block_mut(&mut self) -> &mut DmaBuf {
        &mut self.scratch_block
    }

    pub fn fragment_range(&self) -> Range<usize> {
        self.fragment.clone()
    }

    /// The stored envelope (reads) or the whole input block (writes).
    pub fn fragment(&self) -> &[u8] {
        &self.data_block[self.fragment.clone()]
    }

    /// Mutable view of the fragment, for building source descriptors.
    pub fn fragment_mut(&mut self) -> &mut [u8] {
        let range = self.fragment.clone();
        &mut self.data_block[range]
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    pub fn compression(&self) -> CompressionState {
        self.compression
    }

    pub fn read_block(&self) -> ReadBlock {
        self.read_block
    }

    pub fn set_compressed(&mut self, size: usize) {
        self.compression = CompressionState {
            size,
            data: CompressedData::ScratchBlock,
        };
    }

    pub fn set_incompressible(&mut self) {
        self.compression = CompressionState {
            size: self.incompressible_size(),
            data: CompressedData::None,
        };
    }

    pub fn is_incompressible(&self) -> bool {
        self.compression.size > self.block_size
    }

    /// The envelope in the scratch block, if the write compressed.
    pub fn compressed_data(&self) -> Option<&[u8]> {
        match self.compression.data {
            CompressedData::ScratchBlock if !self.is_incompressible() => {
                Some(&self.scratch_block[..self.compression.size])
            }
            _ => None,
        }
    }

    pub fn set_read_success(&mut self, length: usize) {
        self.read_block = ReadBlock {
            status: ReadStatus::Success,
            data: ReadData::ScratchBlock,
            length,
        };
    }

    pub fn set_invalid_fragment(&mut self) {
        self.read_block = ReadBlock {
            status: ReadStatus::InvalidFragment,
            data: ReadData::None,
            length: 0,
        };
    }

    /// The decoded block, if the read succeeded.
    pub fn read_data(&self) -> Option<&[u8]> {
        match (self.read_block.status, self.read_block.data) {
            (ReadStatus::Success, ReadData::ScratchBlock) => {
                Some(&self.scratch_block[..self.read_block.length])
            }
            _ => None,
        }
    }

    /// Swap the continuation, returning the previous one.
    pub fn replace_continuation(&mut self, continuation: Continuation) -> Option<Continuation> {
        self.continuation.replace(continuation)
    }

    /// Hand the context to its continuation.
    pub fn enqueue_callback(mut self) {
        let id = self.id;
        match self.continuation.take() {
            Some(Continuation::Queue(tx)) => {
                if tx.send(self).is_err() {
                    warn!(vio = id, "continuation queue closed, dropping context");
                }
            }
            Some(Continuation::Oneshot(tx)) => {
                if tx.send(self).is_err() {
                    warn!(vio = id, "continuation receiver dropped, dropping context");
                }
            }
            Some(Continuation::Callback(f)) => f(self),
            None => warn!(vio = id, "context has no continuation"),
        }
        trace!(vio = id, "context forwarded");
    }
}

impl fmt::Debug for DataVio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataVio")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("block_size", &self.block_size)
            .field("fragment", &self.fragment)
            .field("compression", &self.compression)
            .field("read_block", &self.read_block)
            .field("continuation", &self.continuation)
            .finish()
    }
}
