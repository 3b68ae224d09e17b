//! Prometheus exporter for [`AcceleratorPool`] statistics.
//!
//! Counters are monotonic in Prometheus but snapshots are absolute, so each
//! [`OffloadMetrics::update`] adds the delta since the previous snapshot.

use bytes::Bytes;
use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};
use crate::pool::AcceleratorPool;
use crate::stats::OffloadStatsSnapshot;

const NAMESPACE: &str = "dedupe_offload";

#[derive(Default)]
struct Previous {
    stats: OffloadStatsSnapshot,
    channel_jobs: Vec<u64>,
}

/// Prometheus view of one pool.
pub struct OffloadMetrics {
    registry: Registry,
    submitted: IntCounterVec,
    unavailable: IntCounter,
    compressed: IntCounter,
    incompressible: IntCounterVec,
    hardware_failures: IntCounter,
    resource_exhausted: IntCounter,
    rejected: IntCounter,
    decompressed: IntCounter,
    invalid_fragments: IntCounter,
    bytes_in: IntCounter,
    bytes_out: IntCounter,
    channel_jobs: IntCounterVec,
    channels: IntGauge,
    inflight: IntGauge,
    ready: IntGauge,
    contig_live_bytes: IntGauge,
    spare_outstanding: IntGauge,
    channel_state: IntGaugeVec,
    mean_completion_us: Gauge,
    previous: Mutex<Previous>,
}

impl OffloadMetrics {
    /// Create and register every metric in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let submitted = IntCounterVec::new(
            Opts::new("submitted_total", "Requests issued to a channel").namespace(NAMESPACE),
            &["direction"],
        )?;
        let unavailable = IntCounter::with_opts(
            Opts::new("unavailable_total", "Submissions refused because offload was not ready")
                .namespace(NAMESPACE),
        )?;
        let compressed = IntCounter::with_opts(
            Opts::new("compressed_total", "Writes stored compressed").namespace(NAMESPACE),
        )?;
        let incompressible = IntCounterVec::new(
            Opts::new("incompressible_total", "Writes classified incompressible")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let hardware_failures = IntCounter::with_opts(
            Opts::new("hardware_failures_total", "Jobs completed with a failure status")
                .namespace(NAMESPACE),
        )?;
        let resource_exhausted = IntCounter::with_opts(
            Opts::new(
                "resource_exhausted_total",
                "Requests of either direction that could not be built",
            )
            .namespace(NAMESPACE),
        )?;
        let rejected = IntCounter::with_opts(
            Opts::new(
                "rejected_total",
                "Requests of either direction the accelerator refused",
            )
            .namespace(NAMESPACE),
        )?;
        let decompressed = IntCounter::with_opts(
            Opts::new("decompressed_total", "Reads decoded").namespace(NAMESPACE),
        )?;
        let invalid_fragments = IntCounter::with_opts(
            Opts::new("invalid_fragments_total", "Reads resolved as invalid fragments")
                .namespace(NAMESPACE),
        )?;
        let bytes_in = IntCounter::with_opts(
            Opts::new("bytes_in_total", "Uncompressed bytes of compressed writes")
                .namespace(NAMESPACE),
        )?;
        let bytes_out = IntCounter::with_opts(
            Opts::new("bytes_out_total", "Envelope bytes of compressed writes")
                .namespace(NAMESPACE),
        )?;
        let channel_jobs = IntCounterVec::new(
            Opts::new("channel_jobs_total", "Requests issued per channel").namespace(NAMESPACE),
            &["channel"],
        )?;
        let channels = IntGauge::with_opts(
            Opts::new("channels", "Channels serving requests").namespace(NAMESPACE),
        )?;
        let inflight = IntGauge::with_opts(
            Opts::new("inflight", "Requests submitted and not yet completed").namespace(NAMESPACE),
        )?;
        let ready = IntGauge::with_opts(
            Opts::new("ready", "1 when the pool accepts submissions").namespace(NAMESPACE),
        )?;
        let contig_live_bytes = IntGauge::with_opts(
            Opts::new("contiguous_live_bytes", "Live contiguous allocation bytes")
                .namespace(NAMESPACE),
        )?;
        let spare_outstanding = IntGauge::with_opts(
            Opts::new("spare_outstanding", "Spare buffers borrowed by in-flight requests")
                .namespace(NAMESPACE),
        )?;
        let channel_state = IntGaugeVec::new(
            Opts::new("channel_up", "1 while a channel is started").namespace(NAMESPACE),
            &["channel"],
        )?;
        let mean_completion_us = Gauge::with_opts(
            Opts::new("mean_completion_microseconds", "Mean submission-to-completion latency")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(submitted.clone()))?;
        registry.register(Box::new(unavailable.clone()))?;
        registry.register(Box::new(compressed.clone()))?;
        registry.register(Box::new(incompressible.clone()))?;
        registry.register(Box::new(hardware_failures.clone()))?;
        registry.register(Box::new(resource_exhausted.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(decompressed.clone()))?;
        registry.register(Box::new(invalid_fragments.clone()))?;
        registry.register(Box::new(bytes_in.clone()))?;
        registry.register(Box::new(bytes_out.clone()))?;
        registry.register(Box::new(channel_jobs.clone()))?;
        registry.register(Box::new(channels.clone()))?;
        registry.register(Box::new(inflight.clone()))?;
        registry.register(Box::new(ready.clone()))?;
        registry.register(Box::new(contig_live_bytes.clone()))?;
        registry.register(Box::new(spare_outstanding.clone()))?;
        registry.register(Box::new(channel_state.clone()))?;
        registry.register(Box::new(mean_completion_us.clone()))?;

        Ok(Self {
            registry,
            submitted,
            unavailable,
            compressed,
            incompressible,
            hardware_failures,
            resource_exhausted,
            rejected,
            decompressed,
            invalid_fragments,
            bytes_in,
            bytes_out,
            channel_jobs,
            channels,
            inflight,
            ready,
            contig_live_bytes,
            spare_outstanding,
            channel_state,
            mean_completion_us,
            previous: Mutex::new(Previous::default()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Fold the pool's current statistics into the registry.
    pub fn update(&self, pool: &AcceleratorPool) {
        let snap = pool.stats().snapshot();
        let jobs = pool.channel_jobs();
        let mut prev = self.previous.lock();

        let delta = |now: u64, before: u64| now.saturating_sub(before);
        let p = &prev.stats;

        self.submitted
            .with_label_values(&["compress"])
            .inc_by(delta(snap.compress_submitted, p.compress_submitted));
        self.submitted
            .with_label_values(&["decompress"])
            .inc_by(delta(snap.decompress_submitted, p.decompress_submitted));
        self.unavailable
            .inc_by(delta(snap.unavailable, p.unavailable));
        self.compressed.inc_by(delta(snap.compressed, p.compressed));
        self.incompressible
            .with_label_values(&["over_budget"])
            .inc_by(delta(snap.incompressible_over_budget, p.incompressible_over_budget));
        self.incompressible
            .with_label_values(&["page_boundary"])
            .inc_by(delta(snap.incompressible_page_boundary, p.incompressible_page_boundary));
        self.incompressible
            .with_label_values(&["footer_failed"])
            .inc_by(delta(snap.incompressible_footer_failed, p.incompressible_footer_failed));
        self.resource_exhausted
            .inc_by(delta(snap.resource_exhausted, p.resource_exhausted));
        self.rejected.inc_by(delta(snap.rejected, p.rejected));
        self.hardware_failures
            .inc_by(delta(snap.hardware_failures, p.hardware_failures));
        self.decompressed
            .inc_by(delta(snap.decompressed, p.decompressed));
        self.invalid_fragments
            .inc_by(delta(snap.invalid_fragments, p.invalid_fragments));
        self.bytes_in.inc_by(delta(snap.bytes_in, p.bytes_in));
        self.bytes_out.inc_by(delta(snap.bytes_out, p.bytes_out));

        let ready = pool.is_ready();
        for (i, &now) in jobs.iter().enumerate() {
            let label = i.to_string();
            let before = prev.channel_jobs.get(i).copied().unwrap_or(0);
            self.channel_jobs
                .with_label_values(&[&label])
                .inc_by(delta(now, before));
            self.channel_state
                .with_label_values(&[&label])
                .set(i64::from(ready));
        }

        self.channels.set(pool.channel_count() as i64);
        self.inflight.set(pool.inflight() as i64);
        self.ready.set(i64::from(ready));
        self.contig_live_bytes
            .set(pool.allocator().live_bytes() as i64);
        self.spare_outstanding
            .set(pool.spare_cache().outstanding() as i64);
        self.mean_completion_us.set(snap.mean_completion_us);

        prev.stats = snap;
        prev.channel_jobs = jobs;
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<Bytes> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(Error::Metrics)?;
        Ok(Bytes::from(buffer))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}
