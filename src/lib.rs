//! dedupe-offload - Hardware compression offload for block deduplication
//!
//! Submits per-block compress/decompress work to a compression accelerator
//! asynchronously, manages the scatter/gather buffers the accelerator needs,
//! turns results into the stored zlib envelope, classifies blocks as
//! compressible or not, and hands each I/O context back to the pipeline
//! exactly once. The submitting thread never blocks.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ submit     │──▶│ sgl builder  │──▶│ accelerator pool │──▶ channel N
//! │ (caller)   │   │ lists + meta │   │ round-robin      │       │
//! └────────────┘   └──────────────┘   └──────────────────┘       │ async
//!       ▲                                                        ▼
//!       │          ┌──────────────────────────────────────────────────┐
//!       └──────────│ completion: classify, footer, release, forward    │
//!   continuation   └──────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`accel`] - accelerator capability traits and the emulated device
//! - [`completion`] - completion handler and result classification
//! - [`config`] - engine configuration
//! - [`dma`] - aligned contiguous memory, accounting, spare buffer cache
//! - [`envelope`] - zlib envelope helpers and the software codec
//! - [`error`] - error types
//! - [`metrics`] - Prometheus export
//! - [`pool`] - accelerator pool manager and channel lifecycle
//! - [`request`] - per-job completion tag
//! - [`sgl`] - scatter/gather list builder
//! - [`stats`] - engine counters
//! - [`submit`] - submission path
//! - [`vio`] - per-block I/O context and continuation
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dedupe_offload::{AcceleratorPool, Continuation, DataVio, DmaBuf, OffloadConfig};
//! use dedupe_offload::accel::emulated::EmulatedAccelerator;
//!
//! let accel = Arc::new(EmulatedAccelerator::with_instances(4));
//! let pool = AcceleratorPool::initialize(accel, OffloadConfig::default());
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let vio = DataVio::for_write(1, DmaBuf::from_slice(&block)?, Continuation::Queue(tx))?;
//! if let Err(err) = pool.compress(vio) {
//!     // offload unavailable: run the software codec on err.into_vio()
//! }
//! let done = rx.recv().await;
//! ```

pub mod accel;
pub mod completion;
pub mod config;
pub mod dma;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod request;
pub mod sgl;
pub mod stats;
pub mod submit;
pub mod vio;

// Re-export commonly used types
pub use accel::{AccelStatus, Accelerator, Session, SessionSetup};
pub use config::OffloadConfig;
pub use dma::{ContigAllocator, DmaBuf, SpareBufferCache};
pub use envelope::{SoftwareCodec, ZLIB_FOOTER_SIZE, ZLIB_HEADER_SIZE};
pub use error::{Error, Result, SubmitError};
pub use metrics::OffloadMetrics;
pub use pool::{AcceleratorPool, PoolState};
pub use stats::{IncompressibleReason, OffloadStats, OffloadStatsSnapshot};
pub use vio::{Continuation, DataVio, ReadStatus};

/// Returns the crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
