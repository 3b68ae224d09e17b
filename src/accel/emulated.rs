//! Emulated compression accelerator
//!
//! A software device that honours the [`Accelerator`] / [`Session`] contract
//! closely enough to drive the whole engine without hardware:
//!
//! - each started instance owns one worker thread fed by a crossbeam
//!   channel; jobs complete on that thread through the session callback
//! - descriptors are read as real memory: the worker gathers the source
//!   list, runs raw deflate/inflate with `flate2`, and scatters the output
//!   across the destination segments
//! - a [`FaultInjector`] forces hardware failures, synchronous rejections,
//!   a fixed `produced` count, or start/session failures
//!
//! ```text
//!  submit thread                      instance worker
//!  ─────────────                      ───────────────
//!  session.compress_data(req) ──Job──▶ gather(src) → deflate → scatter(dst)
//!                                      results = {produced, consumed, adler}
//!                                      callback(req, status)
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{
    AccelResult, AccelStatus, Accelerator, AddressTranslation, ChecksumType, CompletionCallback,
    CompressionType, DcResults, Rejected, Session, SessionSetup, SessionState,
};
use crate::dma::ContigBuf;
use crate::envelope::{zlib_header, ZLIB_FOOTER_SIZE, ZLIB_HEADER_SIZE};
use crate::request::{Direction, Request};
use crate::sgl::{IntermediateBuffer, ScatterGatherList};

const NONE: usize = usize::MAX;

// =============================================================================
// Configuration
// =============================================================================

/// Shape of the emulated device.
#[derive(Debug, Clone)]
pub struct EmulatedConfig {
    /// Number of compression instances
    pub instances: usize,
    /// Intermediate buffers each instance needs to start
    pub intermediate_buffers: usize,
    /// Fixed part of the per-list metadata blob
    pub meta_base: usize,
    /// Per-descriptor part of the metadata blob
    pub meta_per_buffer: usize,
    /// Session memory size
    pub session_size: usize,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self {
            instances: 4,
            intermediate_buffers: 2,
            meta_base: 64,
            meta_per_buffer: 16,
            session_size: 1024,
        }
    }
}

// =============================================================================
// Fault injection
// =============================================================================

/// Switchable faults. Every setting stays in effect until changed.
#[derive(Debug)]
pub struct FaultInjector {
    fail_compress: AtomicBool,
    fail_decompress: AtomicBool,
    reject_submissions: AtomicBool,
    produced_override: AtomicUsize,
    fail_start_instance: AtomicUsize,
    fail_session_init: AtomicBool,
    job_delay_us: AtomicU64,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self {
            fail_compress: AtomicBool::new(false),
            fail_decompress: AtomicBool::new(false),
            reject_submissions: AtomicBool::new(false),
            produced_override: AtomicUsize::new(NONE),
            fail_start_instance: AtomicUsize::new(NONE),
            fail_session_init: AtomicBool::new(false),
            job_delay_us: AtomicU64::new(0),
        }
    }
}

impl FaultInjector {
    /// Complete every compression job with a hardware failure.
    pub fn set_fail_compress(&self, fail: bool) {
        self.fail_compress.store(fail, Ordering::SeqCst);
    }

    /// Complete every decompression job with a hardware failure.
    pub fn set_fail_decompress(&self, fail: bool) {
        self.fail_decompress.store(fail, Ordering::SeqCst);
    }

    /// Refuse submissions synchronously with [`AccelStatus::Retry`].
    pub fn set_reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Report `produced` bytes for compression jobs regardless of the real
    /// output length.
    pub fn set_produced_override(&self, produced: Option<usize>) {
        self.produced_override
            .store(produced.unwrap_or(NONE), Ordering::SeqCst);
    }

    /// Fail `start_instance` for the given index.
    pub fn set_fail_start_instance(&self, instance: Option<usize>) {
        self.fail_start_instance
            .store(instance.unwrap_or(NONE), Ordering::SeqCst);
    }

    pub fn set_fail_session_init(&self, fail: bool) {
        self.fail_session_init.store(fail, Ordering::SeqCst);
    }

    /// Sleep before processing each job.
    pub fn set_job_delay(&self, delay: Duration) {
        self.job_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Reset every fault.
    pub fn clear(&self) {
        self.set_fail_compress(false);
        self.set_fail_decompress(false);
        self.set_reject_submissions(false);
        self.set_produced_override(None);
        self.set_fail_start_instance(None);
        self.set_fail_session_init(false);
        self.set_job_delay(Duration::ZERO);
    }

    fn produced_override(&self) -> Option<usize> {
        match self.produced_override.load(Ordering::SeqCst) {
            NONE => None,
            n => Some(n),
        }
    }

    fn job_delay(&self) -> Duration {
        Duration::from_micros(self.job_delay_us.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Device
// =============================================================================

enum Job {
    Run {
        direction: Direction,
        request: Box<Request>,
        core: Arc<SessionCore>,
    },
    Stop,
}

struct Worker {
    tx: Sender<Job>,
    handle: JoinHandle<()>,
    thread: ThreadId,
}

#[derive(Default)]
struct InstanceSlot {
    translation: Mutex<Option<AddressTranslation>>,
    worker: Mutex<Option<Worker>>,
    processed: Arc<AtomicU64>,
}

/// Software-backed accelerator.
pub struct EmulatedAccelerator {
    config: EmulatedConfig,
    faults: Arc<FaultInjector>,
    instances: Vec<InstanceSlot>,
}

impl EmulatedAccelerator {
    pub fn new(config: EmulatedConfig) -> Self {
        let instances = (0..config.instances)
            .map(|_| InstanceSlot::default())
            .collect();
        Self {
            config,
            faults: Arc::new(FaultInjector::default()),
            instances,
        }
    }

    /// Device with `instances` instances and default sizing.
    pub fn with_instances(instances: usize) -> Self {
        Self::new(EmulatedConfig {
            instances,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &EmulatedConfig {
        &self.config
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// Number of instances with a live worker.
    pub fn running_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|slot| slot.worker.lock().is_some())
            .count()
    }

    /// Jobs processed by `instance` since creation.
    pub fn jobs_processed(&self, instance: usize) -> u64 {
        self.instances
            .get(instance)
            .map_or(0, |slot| slot.processed.load(Ordering::SeqCst))
    }

    fn slot(&self, instance: usize) -> AccelResult<&InstanceSlot> {
        self.instances
            .get(instance)
            .ok_or(AccelStatus::InvalidParam)
    }

    fn check_setup(setup: &SessionSetup) -> AccelResult<()> {
        if setup.comp_type != CompressionType::Deflate || setup.state != SessionState::Stateless {
            return Err(AccelStatus::Unsupported);
        }
        if !(1..=9).contains(&setup.level) {
            return Err(AccelStatus::InvalidParam);
        }
        Ok(())
    }
}

impl Accelerator for EmulatedAccelerator {
    fn name(&self) -> &str {
        "emulated"
    }

    fn instance_count(&self) -> AccelResult<usize> {
        Ok(self.instances.len())
    }

    fn set_address_translation(
        &self,
        instance: usize,
        translate: AddressTranslation,
    ) -> AccelResult<()> {
        *self.slot(instance)?.translation.lock() = Some(translate);
        Ok(())
    }

    fn buffer_list_meta_size(&self, instance: usize, num_buffers: usize) -> AccelResult<usize> {
        self.slot(instance)?;
        if num_buffers == 0 {
            return Err(AccelStatus::InvalidParam);
        }
        Ok(self.config.meta_base + num_buffers * self.config.meta_per_buffer)
    }

    fn intermediate_buffer_count(&self, instance: usize) -> AccelResult<usize> {
        self.slot(instance)?;
        Ok(self.config.intermediate_buffers)
    }

    fn start_instance(&self, instance: usize, buffers: &[IntermediateBuffer]) -> AccelResult<()> {
        let slot = self.slot(instance)?;
        if self.faults.fail_start_instance.load(Ordering::SeqCst) == instance {
            return Err(AccelStatus::Fail);
        }
        if slot.translation.lock().is_none() {
            return Err(AccelStatus::InvalidParam);
        }
        if buffers.len() != self.config.intermediate_buffers
            || buffers.iter().any(|b| b.is_empty())
        {
            return Err(AccelStatus::InvalidParam);
        }

        let mut worker = slot.worker.lock();
        if worker.is_some() {
            return Err(AccelStatus::InvalidParam);
        }

        let (tx, rx) = channel::unbounded();
        let processed = Arc::clone(&slot.processed);
        let handle = thread::Builder::new()
            .name(format!("dc-emu-{}", instance))
            .spawn(move || run_worker(instance, rx, processed))
            .map_err(|_| AccelStatus::Resource)?;

        *worker = Some(Worker {
            tx,
            thread: handle.thread().id(),
            handle,
        });
        debug!(instance, "emulated instance started");
        Ok(())
    }

    fn stop_instance(&self, instance: usize) -> AccelResult<()> {
        let Some(worker) = self.slot(instance)?.worker.lock().take() else {
            return Ok(());
        };

        let _ = worker.tx.send(Job::Stop);
        if thread::current().id() == worker.thread {
            // Stopping from inside a completion; the loop exits on its own.
            return Ok(());
        }
        if worker.handle.join().is_err() {
            warn!(instance, "emulated worker panicked");
            return Err(AccelStatus::Fail);
        }
        debug!(instance, "emulated instance stopped");
        Ok(())
    }

    fn session_size(&self, instance: usize, setup: &SessionSetup) -> AccelResult<usize> {
        self.slot(instance)?;
        Self::check_setup(setup)?;
        Ok(self.config.session_size)
    }

    fn init_session(
        &self,
        instance: usize,
        memory: ContigBuf,
        setup: &SessionSetup,
        callback: CompletionCallback,
    ) -> AccelResult<Arc<dyn Session>> {
        let slot = self.slot(instance)?;
        Self::check_setup(setup)?;
        if self.faults.fail_session_init.load(Ordering::SeqCst) {
            return Err(AccelStatus::Fail);
        }
        if memory.len() < self.config.session_size {
            return Err(AccelStatus::InvalidParam);
        }
        let tx = slot
            .worker
            .lock()
            .as_ref()
            .map(|w| w.tx.clone())
            .ok_or(AccelStatus::Restarting)?;

        Ok(Arc::new(EmulatedSession {
            core: Arc::new(SessionCore {
                instance,
                setup: *setup,
                callback,
                faults: Arc::clone(&self.faults),
            }),
            memory: Mutex::new(Some(memory)),
            removed: AtomicBool::new(false),
            tx,
        }))
    }
}

impl Drop for EmulatedAccelerator {
    fn drop(&mut self) {
        for instance in 0..self.instances.len() {
            let _ = self.stop_instance(instance);
        }
    }
}

fn run_worker(instance: usize, rx: Receiver<Job>, processed: Arc<AtomicU64>) {
    trace!(instance, "emulated worker running");
    while let Ok(job) = rx.recv() {
        match job {
            Job::Run {
                direction,
                request,
                core,
            } => {
                core.process(direction, request);
                processed.fetch_add(1, Ordering::SeqCst);
            }
            Job::Stop => break,
        }
    }

    // Anything that raced the stop still gets exactly one completion.
    while let Ok(job) = rx.try_recv() {
        if let Job::Run { request, core, .. } = job {
            (core.callback)(request, Err(AccelStatus::Restarting));
        }
    }
    trace!(instance, "emulated worker exiting");
}

// =============================================================================
// Session
// =============================================================================

struct SessionCore {
    instance: usize,
    setup: SessionSetup,
    callback: CompletionCallback,
    faults: Arc<FaultInjector>,
}

impl SessionCore {
    fn process(&self, direction: Direction, mut request: Box<Request>) {
        let delay = self.faults.job_delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let outcome = match direction {
            Direction::Compress => self.compress(&request),
            Direction::Decompress => self.decompress(&request),
        };
        let status = outcome.map(|results| {
            *request.results_mut() = results;
        });
        trace!(instance = self.instance, %direction, ?status, "emulated job done");
        (self.callback)(request, status);
    }

    fn checksum(&self, data: &[u8]) -> u32 {
        match self.setup.checksum {
            ChecksumType::Adler32 => adler2::adler32_slice(data),
            ChecksumType::None => 0,
        }
    }

    fn compress(&self, request: &Request) -> AccelResult<DcResults> {
        let input = gather(request.source());
        if self.faults.fail_compress.load(Ordering::SeqCst) {
            return Err(AccelStatus::Fail);
        }

        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(input.len()),
            Compression::new(self.setup.level),
        );
        encoder.write_all(&input).map_err(|_| AccelStatus::Fail)?;
        let output = encoder.finish().map_err(|_| AccelStatus::Fail)?;
        scatter(request.destination(), &output)?;

        Ok(DcResults {
            produced: self.faults.produced_override().unwrap_or(output.len()),
            consumed: input.len(),
            checksum: self.checksum(&input),
        })
    }

    fn decompress(&self, request: &Request) -> AccelResult<DcResults> {
        let input = gather(request.source());
        if self.faults.fail_decompress.load(Ordering::SeqCst) {
            return Err(AccelStatus::Fail);
        }

        let capacity = request.destination().total_len();
        let mut output = vec![0u8; capacity];
        let mut inflater = Decompress::new(false);
        let status = inflater
            .decompress(&input, &mut output, FlushDecompress::Finish)
            .map_err(|_| AccelStatus::Fail)?;

        let produced = inflater.total_out() as usize;
        let consumed = inflater.total_in() as usize;
        if status != Status::StreamEnd {
            return Err(if produced == capacity {
                AccelStatus::Overflow
            } else {
                AccelStatus::Fail
            });
        }

        let checksum = self.checksum(&output[..produced]);
        let trailer = &input[consumed..];
        if self.setup.checksum == ChecksumType::Adler32
            && trailer.len() == ZLIB_FOOTER_SIZE
            && trailer != checksum.to_be_bytes()
        {
            return Err(AccelStatus::Fail);
        }

        scatter(request.destination(), &output[..produced])?;
        Ok(DcResults {
            produced,
            consumed,
            checksum,
        })
    }
}

struct EmulatedSession {
    core: Arc<SessionCore>,
    memory: Mutex<Option<ContigBuf>>,
    removed: AtomicBool,
    tx: Sender<Job>,
}

impl EmulatedSession {
    fn submit(
        &self,
        direction: Direction,
        request: Box<Request>,
    ) -> std::result::Result<(), Rejected> {
        let allowed = match direction {
            Direction::Compress => self.core.setup.direction.allows_compress(),
            Direction::Decompress => self.core.setup.direction.allows_decompress(),
        };
        let refused = if self.removed.load(Ordering::SeqCst) {
            Some(AccelStatus::Restarting)
        } else if !allowed {
            Some(AccelStatus::Unsupported)
        } else if self.core.faults.reject_submissions.load(Ordering::SeqCst) {
            Some(AccelStatus::Retry)
        } else {
            None
        };
        if let Some(status) = refused {
            return Err(Rejected { status, request });
        }

        let job = Job::Run {
            direction,
            request,
            core: Arc::clone(&self.core),
        };
        match self.tx.send(job) {
            Ok(()) => Ok(()),
            Err(channel::SendError(Job::Run { request, .. })) => Err(Rejected {
                status: AccelStatus::Restarting,
                request,
            }),
            Err(channel::SendError(Job::Stop)) => Ok(()),
        }
    }
}

impl Session for EmulatedSession {
    fn instance(&self) -> usize {
        self.core.instance
    }

    fn generate_header(&self, dest: &mut [u8]) -> AccelResult<usize> {
        if dest.len() < ZLIB_HEADER_SIZE {
            return Err(AccelStatus::Overflow);
        }
        dest[..ZLIB_HEADER_SIZE].copy_from_slice(&zlib_header(self.core.setup.level));
        Ok(ZLIB_HEADER_SIZE)
    }

    fn generate_footer(&self, dest: &mut [u8], results: &mut DcResults) -> AccelResult<()> {
        if self.core.setup.checksum != ChecksumType::Adler32 {
            return Err(AccelStatus::Unsupported);
        }
        if dest.len() < ZLIB_FOOTER_SIZE {
            return Err(AccelStatus::Overflow);
        }
        dest[..ZLIB_FOOTER_SIZE].copy_from_slice(&results.checksum.to_be_bytes());
        results.produced = ZLIB_FOOTER_SIZE;
        Ok(())
    }

    fn compress_data(&self, request: Box<Request>) -> std::result::Result<(), Rejected> {
        self.submit(Direction::Compress, request)
    }

    fn decompress_data(&self, request: Box<Request>) -> std::result::Result<(), Rejected> {
        self.submit(Direction::Decompress, request)
    }

    fn remove(&self) -> AccelResult<()> {
        if !self.removed.swap(true, Ordering::SeqCst) {
            self.memory.lock().take();
            trace!(instance = self.core.instance, "emulated session removed");
        }
        Ok(())
    }
}

// =============================================================================
// Descriptor access
// =============================================================================

fn gather(list: &ScatterGatherList) -> Vec<u8> {
    let mut data = Vec::with_capacity(list.total_len());
    for seg in list.segments() {
        // SAFETY: the request owning `list` also owns (or borrows, via its
        // context and spare buffer) every segment's memory, and nothing else
        // touches it while the job runs.
        data.extend_from_slice(unsafe { seg.as_slice() });
    }
    data
}

fn scatter(list: &ScatterGatherList, mut data: &[u8]) -> AccelResult<()> {
    if data.len() > list.total_len() {
        return Err(AccelStatus::Overflow);
    }
    for seg in list.segments() {
        if data.is_empty() {
            break;
        }
        let n = seg.len().min(data.len());
        // SAFETY: as in `gather`; the destination memory is exclusively the
        // job's until completion.
        unsafe { seg.as_mut_slice()[..n].copy_from_slice(&data[..n]) };
        data = &data[n..];
    }
    Ok(())
}
