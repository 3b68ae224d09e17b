//! Engine statistics
//!
//! Lock-free counters updated from submitting threads and accelerator
//! completion threads, with a serializable snapshot for the CLI and the
//! Prometheus exporter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::Direction;

/// Why a write was classified incompressible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncompressibleReason {
    /// Envelope would exceed one block
    OverBudget,
    /// Footer would straddle a page boundary
    PageBoundary,
    /// Footer generation failed
    FooterFailed,
    /// Accelerator completed the job with a failure status
    HardwareFailure,
    /// Request could not be built
    ResourceExhausted,
    /// Accelerator refused the submission
    Rejected,
}

impl fmt::Display for IncompressibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompressibleReason::OverBudget => write!(f, "over budget"),
            IncompressibleReason::PageBoundary => write!(f, "page boundary"),
            IncompressibleReason::FooterFailed => write!(f, "footer failed"),
            IncompressibleReason::HardwareFailure => write!(f, "hardware failure"),
            IncompressibleReason::ResourceExhausted => write!(f, "resource exhausted"),
            IncompressibleReason::Rejected => write!(f, "rejected"),
        }
    }
}

/// Counters for the offload engine.
#[derive(Debug, Default)]
pub struct OffloadStats {
    /// Compression requests issued to a channel
    pub compress_submitted: AtomicU64,

    /// Decompression requests issued to a channel
    pub decompress_submitted: AtomicU64,

    /// Submissions turned away because the pool was not ready
    pub unavailable: AtomicU64,

    /// Writes that produced a stored envelope
    pub compressed: AtomicU64,

    pub incompressible_over_budget: AtomicU64,
    pub incompressible_page_boundary: AtomicU64,
    pub incompressible_footer_failed: AtomicU64,

    /// Jobs completed with a hardware failure status
    pub hardware_failures: AtomicU64,

    /// Requests that could not be built
    pub resource_exhausted: AtomicU64,

    /// Submissions the accelerator refused
    pub rejected: AtomicU64,

    /// Reads decoded successfully
    pub decompressed: AtomicU64,

    /// Reads resolved as invalid fragments
    pub invalid_fragments: AtomicU64,

    /// Uncompressed bytes of successful writes
    pub bytes_in: AtomicU64,

    /// Envelope bytes of successful writes
    pub bytes_out: AtomicU64,

    /// Submission-to-completion time, summed
    pub completion_time_us: AtomicU64,

    /// Completions observed
    pub completions: AtomicU64,
}

impl OffloadStats {
    pub fn record_submit(&self, direction: Direction) {
        match direction {
            Direction::Compress => &self.compress_submitted,
            Direction::Decompress => &self.decompress_submitted,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compressed(&self, input: usize, output: usize) {
        self.compressed.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(input as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(output as u64, Ordering::Relaxed);
    }

    pub fn record_incompressible(&self, reason: IncompressibleReason) {
        let counter = match reason {
            IncompressibleReason::OverBudget => &self.incompressible_over_budget,
            IncompressibleReason::PageBoundary => &self.incompressible_page_boundary,
            IncompressibleReason::FooterFailed => &self.incompressible_footer_failed,
            IncompressibleReason::HardwareFailure => &self.hardware_failures,
            IncompressibleReason::ResourceExhausted => &self.resource_exhausted,
            IncompressibleReason::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decompressed(&self) {
        self.decompressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an invalid fragment, with the failure that caused it.
    pub fn record_invalid_fragment(&self, cause: Option<IncompressibleReason>) {
        self.invalid_fragments.fetch_add(1, Ordering::Relaxed);
        match cause {
            Some(IncompressibleReason::HardwareFailure) => {
                self.hardware_failures.fetch_add(1, Ordering::Relaxed);
            }
            Some(IncompressibleReason::ResourceExhausted) => {
                self.resource_exhausted.fetch_add(1, Ordering::Relaxed);
            }
            Some(IncompressibleReason::Rejected) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_completion(&self, elapsed: Duration) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        self.completion_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Writes classified incompressible for any reason.
    pub fn incompressible(&self) -> u64 {
        self.incompressible_over_budget.load(Ordering::Relaxed)
            + self.incompressible_page_boundary.load(Ordering::Relaxed)
            + self.incompressible_footer_failed.load(Ordering::Relaxed)
    }

    /// Fraction of input bytes saved by successful writes.
    pub fn overall_ratio(&self) -> f64 {
        let input = self.bytes_in.load(Ordering::Relaxed);
        let output = self.bytes_out.load(Ordering::Relaxed);
        if input == 0 {
            0.0
        } else {
            1.0 - (output as f64 / input as f64)
        }
    }

    /// Mean submission-to-completion latency in microseconds.
    pub fn mean_completion_us(&self) -> f64 {
        let n = self.completions.load(Ordering::Relaxed);
        if n == 0 {
            0.0
        } else {
            self.completion_time_us.load(Ordering::Relaxed) as f64 / n as f64
        }
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> OffloadStatsSnapshot {
        OffloadStatsSnapshot {
            compress_submitted: self.compress_submitted.load(Ordering::Relaxed),
            decompress_submitted: self.decompress_submitted.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            compressed: self.compressed.load(Ordering::Relaxed),
            incompressible_over_budget: self.incompressible_over_budget.load(Ordering::Relaxed),
            incompressible_page_boundary: self
                .incompressible_page_boundary
                .load(Ordering::Relaxed),
            incompressible_footer_failed: self
                .incompressible_footer_failed
                .load(Ordering::Relaxed),
            hardware_failures: self.hardware_failures.load(Ordering::Relaxed),
            resource_exhausted: self.resource_exhausted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            decompressed: self.decompressed.load(Ordering::Relaxed),
            invalid_fragments: self.invalid_fragments.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            overall_ratio: self.overall_ratio(),
            mean_completion_us: self.mean_completion_us(),
        }
    }
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OffloadStatsSnapshot {
    pub compress_submitted: u64,
    pub decompress_submitted: u64,
    pub unavailable: u64,
    pub compressed: u64,
    pub incompressible_over_budget: u64,
    pub incompressible_page_boundary: u64,
    pub incompressible_footer_failed: u64,
    pub hardware_failures: u64,
    pub resource_exhausted: u64,
    pub rejected: u64,
    pub decompressed: u64,
    pub invalid_fragments: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub completions: u64,
    pub overall_ratio: f64,
    pub mean_completion_us: f64,
}

impl OffloadStatsSnapshot {
    /// Get total bytes saved through compression.
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_in.saturating_sub(self.bytes_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incompressible_reasons() {
        let stats = OffloadStats::default();
        stats.record_incompressible(IncompressibleReason::OverBudget);
        stats.record_incompressible(IncompressibleReason::PageBoundary);
        stats.record_incompressible(IncompressibleReason::HardwareFailure);
        stats.record_incompressible(IncompressibleReason::Rejected);

        let snap = stats.snapshot();
        assert_eq!(snap.incompressible_over_budget, 1);
        assert_eq!(snap.incompressible_page_boundary, 1);
        assert_eq!(snap.hardware_failures, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(stats.incompressible(), 2);
    }

    #[test]
    fn test_ratio_and_bytes_saved() {
        let stats = OffloadStats::default();
        stats.record_compressed(4096, 1024);
        let snap = stats.snapshot();
        assert!((snap.overall_ratio - 0.75).abs() < 1e-9);
        assert_eq!(snap.bytes_saved(), 3072);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = OffloadStats::default();
        stats.record_submit(Direction::Decompress);
        stats.record_invalid_fragment(Some(IncompressibleReason::HardwareFailure));
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"decompress_submitted\":1"));
        assert!(json.contains("\"invalid_fragments\":1"));
        assert!(json.contains("\"hardware_failures\":1"));
    }
}
