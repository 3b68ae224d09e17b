//! Accelerator Pool Manager
//!
//! Owns the accelerator channels, their persistent sessions and per-channel
//! intermediate buffers, and hands out channels round-robin.
//!
//! # Lifecycle
//!
//! ```text
//!                 initialize()
//! Uninitialized ─────────────▶ Initializing ──ok──▶ Ready
//!       ▲                          │                  │ shutdown()
//!       │◀──── rollback ───────────┘                  ▼
//!       │                                          Draining
//!       └──────────── channels torn down ◀────────────┘
//! ```
//!
//! Initialization never fails hard: any error rolls back what was built and
//! leaves the pool reporting "offload unavailable", so callers fall back to
//! the software codec. A device exposing zero instances is a successful,
//! disabled pool.
//!
//! Draining refuses new submissions and waits for every outstanding request
//! to complete through its normal callback before channels are stopped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::accel::{identity_translation, Accelerator, CompletionCallback, Session, SessionSetup};
use crate::completion::CompletionHandler;
use crate::config::OffloadConfig;
use crate::dma::{ContigAllocator, SpareBufferCache};
use crate::error::{Error, Result};
use crate::sgl::{IntermediateBuffer, SgListBuilder};
use crate::stats::OffloadStats;

/// Name of the spare buffer cache, as it appears in logs.
const SPARE_CACHE_NAME: &str = "offload_spare";

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Draining = 3,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PoolState::Initializing,
            2 => PoolState::Ready,
            3 => PoolState::Draining,
            _ => PoolState::Uninitialized,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Uninitialized => write!(f, "uninitialized"),
            PoolState::Initializing => write!(f, "initializing"),
            PoolState::Ready => write!(f, "ready"),
            PoolState::Draining => write!(f, "draining"),
        }
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// State shared between the pool, its requests and the completion handler.
pub(crate) struct PoolShared {
    pub(crate) config: OffloadConfig,
    pub(crate) allocator: Arc<ContigAllocator>,
    pub(crate) spare: SpareBufferCache,
    pub(crate) stats: Arc<OffloadStats>,
    inflight: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl PoolShared {
    fn new(config: OffloadConfig, allocator: Arc<ContigAllocator>) -> Self {
        let spare = SpareBufferCache::with_capacity(
            SPARE_CACHE_NAME,
            config.block_size,
            config.spare_cache_capacity,
        );
        Self {
            config,
            allocator,
            spare,
            stats: Arc::new(OffloadStats::default()),
            inflight: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    fn wait_drained(&self) {
        let mut guard = self.drain_lock.lock();
        while self.inflight.load(Ordering::SeqCst) > 0 {
            self.drained.wait(&mut guard);
        }
    }
}

/// Counts one outstanding request. Dropped when the request is finished.
pub struct InflightGuard {
    shared: Arc<PoolShared>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.shared.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.shared.drain_lock.lock();
            self.shared.drained.notify_all();
        }
    }
}

impl fmt::Debug for InflightGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InflightGuard")
    }
}

// =============================================================================
// Channel
// =============================================================================

/// One started accelerator instance with its session.
pub(crate) struct Channel {
    index: usize,
    accel: Arc<dyn Accelerator>,
    session: Arc<dyn Session>,
    intermediate: Mutex<Vec<IntermediateBuffer>>,
    started: AtomicBool,
    jobs: AtomicU64,
}

impl Channel {
    /// Bring up instance `index`: translation hook, intermediate buffers,
    /// start, session. A failure leaves nothing running or allocated.
    fn open(
        accel: &Arc<dyn Accelerator>,
        shared: &Arc<PoolShared>,
        index: usize,
        callback: CompletionCallback,
    ) -> Result<Self> {
        accel
            .set_address_translation(index, identity_translation)
            .map_err(|status| Error::accel("set_address_translation", status))?;

        let count = accel
            .intermediate_buffer_count(index)
            .map_err(|status| Error::accel("intermediate_buffer_count", status))?;
        let size = shared.config.intermediate_buffer_size();
        let builder = SgListBuilder::new(&shared.allocator, accel.as_ref(), index);
        let intermediate = (0..count)
            .map(|_| builder.intermediate(size))
            .collect::<Result<Vec<_>>>()?;

        accel
            .start_instance(index, &intermediate)
            .map_err(|status| Error::accel("start_instance", status))?;

        let session = match Self::create_session(accel, shared, index, callback) {
            Ok(session) => session,
            Err(e) => {
                if let Err(status) = accel.stop_instance(index) {
                    warn!(channel = index, %status, "failed to stop instance during rollback");
                }
                return Err(e);
            }
        };

        debug!(channel = index, intermediate = count, "channel ready");
        Ok(Self {
            index,
            accel: Arc::clone(accel),
            session,
            intermediate: Mutex::new(intermediate),
            started: AtomicBool::new(true),
            jobs: AtomicU64::new(0),
        })
    }

    fn create_session(
        accel: &Arc<dyn Accelerator>,
        shared: &Arc<PoolShared>,
        index: usize,
        callback: CompletionCallback,
    ) -> Result<Arc<dyn Session>> {
        let setup = SessionSetup::deflate(shared.config.compression_level);
        let size = accel
            .session_size(index, &setup)
            .map_err(|status| Error::accel("session_size", status))?;
        let memory = shared.allocator.alloc(size)?;
        accel
            .init_session(index, memory, &setup, callback)
            .map_err(|status| Error::accel("init_session", status))
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub(crate) fn record_job(&self) {
        self.jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn jobs(&self) -> u64 {
        self.jobs.load(Ordering::Relaxed)
    }

    /// Stop the instance, remove the session and free the intermediate
    /// buffers. Runs once.
    fn teardown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(status) = self.accel.stop_instance(self.index) {
            warn!(channel = self.index, %status, "failed to stop instance");
        }
        if let Err(status) = self.session.remove() {
            warn!(channel = self.index, %status, "failed to remove session");
        }
        self.intermediate.lock().clear();
        debug!(channel = self.index, "channel torn down");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.teardown();
    }
}

// =============================================================================
// Pool
// =============================================================================

/// The set of accelerator channels and everything they share.
pub struct AcceleratorPool {
    accel: Arc<dyn Accelerator>,
    pub(crate) shared: Arc<PoolShared>,
    channels: Vec<Channel>,
    next: AtomicUsize,
    state: AtomicU8,
    init_error: Option<String>,
}

impl AcceleratorPool {
    /// Bring the pool up. Never fails: on error the pool is returned in the
    /// `Uninitialized` state and every submission reports "offload
    /// unavailable".
    ///
    /// The pool keeps the allocator of a failed attempt, so its counters
    /// show what the rollback released.
    pub fn initialize(accel: Arc<dyn Accelerator>, config: OffloadConfig) -> Self {
        let allocator = ContigAllocator::new(config.memory_limit);
        match Self::open(Arc::clone(&accel), config.clone(), Arc::clone(&allocator)) {
            Ok(pool) => pool,
            Err(e) => {
                warn!(accelerator = accel.name(), error = %e, "compression offload unavailable");
                let shared = Arc::new(PoolShared::new(config, allocator));
                shared.spare.destroy();
                Self {
                    accel,
                    shared,
                    channels: Vec::new(),
                    next: AtomicUsize::new(0),
                    state: AtomicU8::new(PoolState::Uninitialized as u8),
                    init_error: Some(e.to_string()),
                }
            }
        }
    }

    /// Bring the pool up, reporting the failure that stopped it.
    pub fn try_initialize(accel: Arc<dyn Accelerator>, config: OffloadConfig) -> Result<Self> {
        let allocator = ContigAllocator::new(config.memory_limit);
        Self::open(accel, config, allocator)
    }

    #[instrument(skip(accel, config, allocator), fields(accelerator = accel.name()))]
    fn open(
        accel: Arc<dyn Accelerator>,
        config: OffloadConfig,
        allocator: Arc<ContigAllocator>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(PoolShared::new(config, allocator));
        let mut pool = Self {
            accel: Arc::clone(&accel),
            shared: Arc::clone(&shared),
            channels: Vec::new(),
            next: AtomicUsize::new(0),
            state: AtomicU8::new(PoolState::Initializing as u8),
            init_error: None,
        };

        let available = accel
            .instance_count()
            .map_err(|status| Error::accel("instance_count", status))?;
        let count = available.min(shared.config.max_channels);
        if count == 0 {
            info!(available, "no accelerator channels, compression offload disabled");
            shared.spare.destroy();
            pool.state
                .store(PoolState::Uninitialized as u8, Ordering::SeqCst);
            return Ok(pool);
        }

        // Dropping `pool` on any error below tears down the channels opened
        // so far and destroys the spare cache.
        let handler = Arc::new(CompletionHandler::new(Arc::clone(&shared)));
        for index in 0..count {
            let handler = Arc::clone(&handler);
            let callback: CompletionCallback =
                Arc::new(move |request, status| handler.on_complete(request, status));
            let channel = Channel::open(&accel, &shared, index, callback)?;
            pool.channels.push(channel);
        }

        {
            let mut idle = Vec::with_capacity(shared.config.spare_cache_initial);
            for _ in 0..shared.config.spare_cache_initial {
                idle.push(shared.spare.get()?);
            }
        }

        pool.state.store(PoolState::Ready as u8, Ordering::SeqCst);
        info!(
            channels = count,
            available,
            level = shared.config.compression_level,
            "compression offload ready"
        );
        Ok(pool)
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PoolState::Ready
    }

    /// Whether a buffer of `len` bytes can be offloaded right now.
    pub fn is_eligible(&self, len: usize) -> bool {
        self.is_ready() && self.shared.config.in_offload_window(len)
    }

    /// Number of channels serving requests.
    pub fn channel_count(&self) -> usize {
        if self.is_ready() {
            self.channels.len()
        } else {
            0
        }
    }

    /// Jobs issued per channel, in channel order.
    pub fn channel_jobs(&self) -> Vec<u64> {
        self.channels.iter().map(Channel::jobs).collect()
    }

    /// Pick the next channel round-robin.
    pub(crate) fn select_channel(&self) -> Option<&Channel> {
        let n = self.channels.len();
        if n == 0 {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % n;
        self.channels.get(i)
    }

    /// Register an outstanding request if the pool is ready.
    pub(crate) fn begin_request(&self) -> Option<InflightGuard> {
        self.shared.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard {
            shared: Arc::clone(&self.shared),
        };
        if self.state.load(Ordering::SeqCst) != PoolState::Ready as u8 {
            return None;
        }
        Some(guard)
    }

    /// Requests submitted and not yet completed.
    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::SeqCst)
    }

    /// Stop accepting work, wait for outstanding requests, and tear every
    /// channel down. Idempotent.
    ///
    /// Must not be called from a continuation: requests queued behind it on
    /// the same completion thread could never finish. Dropping the pool
    /// there is fine; `Drop` does not wait.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        self.close(true);
    }

    /// Leave `Ready` and tear the channels down. Without `wait`, requests
    /// still queued are completed by the accelerator as it stops each
    /// instance, which also holds when the pool is dropped on one of its own
    /// completion threads.
    fn close(&self, wait: bool) {
        if self
            .state
            .compare_exchange(
                PoolState::Ready as u8,
                PoolState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        info!(inflight = self.inflight(), "draining compression offload");
        if wait {
            self.shared.wait_drained();
        }

        for channel in &self.channels {
            channel.teardown();
        }
        self.shared.spare.destroy();
        self.state
            .store(PoolState::Uninitialized as u8, Ordering::SeqCst);
        info!("compression offload shut down");
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> Arc<OffloadStats> {
        Arc::clone(&self.shared.stats)
    }

    pub fn allocator(&self) -> &Arc<ContigAllocator> {
        &self.shared.allocator
    }

    pub fn spare_cache(&self) -> &SpareBufferCache {
        &self.shared.spare
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accel
    }

    /// Why initialization failed, if it did.
    pub fn init_error(&self) -> Option<&str> {
        self.init_error.as_deref()
    }
}

impl Drop for AcceleratorPool {
    fn drop(&mut self) {
        self.close(false);
        if !self.shared.spare.is_destroyed() {
            self.shared.spare.destroy();
        }
    }
}

impl fmt::Debug for AcceleratorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorPool")
            .field("accelerator", &self.accel.name())
            .field("state", &self.state())
            .field("channels", &self.channels.len())
            .field("inflight", &self.inflight())
            .field("init_error", &self.init_error)
            .finish()
    }
}
