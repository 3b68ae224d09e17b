//! Accelerator capability
//!
//! The engine drives a data-compression accelerator through two traits:
//!
//! - [`Accelerator`] - device-level calls: enumerate instances, size
//!   metadata, start/stop an instance, create sessions
//! - [`Session`] - per-instance persistent session: envelope header/footer
//!   generation and asynchronous compress/decompress submission
//!
//! Jobs complete by calling the [`CompletionCallback`] registered with the
//! session, on a thread the accelerator owns, handing back the boxed
//! [`Request`] that was submitted together with the job status.
//!
//! The only backend shipped here is [`emulated::EmulatedAccelerator`], a
//! software device with per-instance worker threads and fault injection.

pub mod emulated;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dma::ContigBuf;
use crate::request::Request;
use crate::sgl::IntermediateBuffer;

// =============================================================================
// Status
// =============================================================================

/// Failure status reported by an accelerator call or a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccelStatus {
    /// Generic failure
    Fail,
    /// Queue full, try again
    Retry,
    /// Out of device resources
    Resource,
    /// Bad argument
    InvalidParam,
    /// Operation not supported by this session or device
    Unsupported,
    /// Instance is stopping or restarting
    Restarting,
    /// Output did not fit in the destination list
    Overflow,
}

impl fmt::Display for AccelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccelStatus::Fail => "fail",
            AccelStatus::Retry => "retry",
            AccelStatus::Resource => "resource",
            AccelStatus::InvalidParam => "invalid parameter",
            AccelStatus::Unsupported => "unsupported",
            AccelStatus::Restarting => "restarting",
            AccelStatus::Overflow => "overflow",
        };
        f.write_str(s)
    }
}

/// Result of an accelerator call.
pub type AccelResult<T> = std::result::Result<T, AccelStatus>;

/// Counters filled in by the accelerator for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DcResults {
    /// Bytes written to the destination
    pub produced: usize,
    /// Bytes read from the source
    pub consumed: usize,
    /// Running checksum of the uncompressed data
    pub checksum: u32,
}

// =============================================================================
// Session setup
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    Deflate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HuffmanType {
    Static,
    FullDynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDirection {
    Compress,
    Decompress,
    Combined,
}

impl SessionDirection {
    pub fn allows_compress(&self) -> bool {
        matches!(self, SessionDirection::Compress | SessionDirection::Combined)
    }

    pub fn allows_decompress(&self) -> bool {
        matches!(self, SessionDirection::Decompress | SessionDirection::Combined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Stateless,
    Stateful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    None,
    Adler32,
}

/// Parameters fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSetup {
    pub comp_type: CompressionType,
    /// Deflate level, 1-9
    pub level: u32,
    pub huffman: HuffmanType,
    pub direction: SessionDirection,
    pub state: SessionState,
    pub checksum: ChecksumType,
    /// Deflate window size code (7 = 32 KiB)
    pub window_size: u8,
}

impl SessionSetup {
    /// Profile used for every channel: stateless combined-direction deflate
    /// with dynamic Huffman and an Adler-32 running checksum.
    pub fn deflate(level: u32) -> Self {
        Self {
            comp_type: CompressionType::Deflate,
            level,
            huffman: HuffmanType::FullDynamic,
            direction: SessionDirection::Combined,
            state: SessionState::Stateless,
            checksum: ChecksumType::Adler32,
            window_size: 7,
        }
    }
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self::deflate(1)
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Virtual-to-device address translation hook registered per instance.
pub type AddressTranslation = fn(u64) -> u64;

/// Identity translation, for devices that work on virtual addresses.
pub fn identity_translation(addr: u64) -> u64 {
    addr
}

/// Called by the accelerator once per accepted job.
pub type CompletionCallback = Arc<dyn Fn(Box<Request>, AccelResult<()>) + Send + Sync>;

/// A submission the accelerator refused synchronously. The request comes
/// back untouched so the caller can release it.
pub struct Rejected {
    pub status: AccelStatus,
    pub request: Box<Request>,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("status", &self.status)
            .field("vio", &self.request.vio().id())
            .finish()
    }
}

/// Device-level accelerator API.
pub trait Accelerator: Send + Sync {
    /// Backend name for logs and metrics.
    fn name(&self) -> &str;

    /// Number of compression instances the device exposes.
    fn instance_count(&self) -> AccelResult<usize>;

    /// Register the address translation hook for `instance`. Must precede
    /// [`start_instance`](Self::start_instance).
    fn set_address_translation(
        &self,
        instance: usize,
        translate: AddressTranslation,
    ) -> AccelResult<()>;

    /// Size of the private metadata blob for a list of `num_buffers`.
    fn buffer_list_meta_size(&self, instance: usize, num_buffers: usize) -> AccelResult<usize>;

    /// Number of intermediate buffers `instance` needs to start.
    fn intermediate_buffer_count(&self, instance: usize) -> AccelResult<usize>;

    /// Start `instance` with its intermediate buffers. The caller keeps the
    /// buffers alive until [`stop_instance`](Self::stop_instance) returns.
    fn start_instance(&self, instance: usize, buffers: &[IntermediateBuffer]) -> AccelResult<()>;

    /// Stop `instance`. Jobs already accepted are completed first.
    fn stop_instance(&self, instance: usize) -> AccelResult<()>;

    /// Bytes of session memory needed for `setup`.
    fn session_size(&self, instance: usize, setup: &SessionSetup) -> AccelResult<usize>;

    /// Create a session on a started instance. The session owns `memory`
    /// until it is removed.
    fn init_session(
        &self,
        instance: usize,
        memory: ContigBuf,
        setup: &SessionSetup,
        callback: CompletionCallback,
    ) -> AccelResult<Arc<dyn Session>>;
}

/// Persistent per-instance session.
pub trait Session: Send + Sync {
    /// Instance this session is bound to.
    fn instance(&self) -> usize;

    /// Write the envelope header into `dest`, returning its length.
    fn generate_header(&self, dest: &mut [u8]) -> AccelResult<usize>;

    /// Write the envelope footer for a finished job into `dest`. On return
    /// `results.produced` is the footer length.
    fn generate_footer(&self, dest: &mut [u8], results: &mut DcResults) -> AccelResult<()>;

    /// Queue a compression job.
    fn compress_data(&self, request: Box<Request>) -> std::result::Result<(), Rejected>;

    /// Queue a decompression job.
    fn decompress_data(&self, request: Box<Request>) -> std::result::Result<(), Rejected>;

    /// Tear the session down and release its memory. Idempotent.
    fn remove(&self) -> AccelResult<()>;
}
