//! Completion Handler
//!
//! Runs on accelerator-owned threads, once per accepted job, and also
//! resolves requests that failed before reaching the hardware. Every path
//! ends the same way: descriptor lists and metadata released, spare buffer
//! returned, result fields set, in-flight count released, and only then the
//! context forwarded to its continuation, exactly once.
//!
//! # Compression classification
//!
//! ```text
//! produced + header + footer > block_size              → incompressible
//! ((produced + header) mod page) + footer > page_size  → incompressible
//! footer generation fails                              → incompressible
//! otherwise  size = header + produced + footer, data = scratch block
//! ```
//!
//! An incompressible write reports `block_size + 1` and carries no data.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::accel::{AccelResult, DcResults, Session};
use crate::envelope::ZLIB_FOOTER_SIZE;
use crate::error::Error;
use crate::pool::{InflightGuard, PoolShared};
use crate::request::{Direction, Request};
use crate::stats::IncompressibleReason;
use crate::vio::DataVio;

pub struct CompletionHandler {
    shared: Arc<PoolShared>,
}

impl CompletionHandler {
    pub(crate) fn new(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    /// Accelerator completion entry point.
    pub fn on_complete(&self, request: Box<Request>, status: AccelResult<()>) {
        let Request {
            direction,
            channel,
            session,
            source,
            destination,
            spare,
            mut results,
            header_size,
            mut vio,
            submitted_at,
            inflight,
        } = *request;

        drop(source);
        drop(destination);
        drop(spare);

        trace!(vio = vio.id(), channel, %direction, ?status, "completion");
        match (direction, status) {
            (Direction::Compress, Ok(())) => {
                self.finish_compress(session.as_ref(), &mut vio, &mut results, header_size);
            }
            (Direction::Compress, Err(status)) => {
                debug!(vio = vio.id(), channel, %status, "compression failed in hardware");
                vio.set_incompressible();
                self.shared
                    .stats
                    .record_incompressible(IncompressibleReason::HardwareFailure);
            }
            (Direction::Decompress, Ok(())) => {
                if results.produced == vio.block_size() {
                    vio.set_read_success(results.produced);
                    self.shared.stats.record_decompressed();
                } else {
                    debug!(
                        vio = vio.id(),
                        produced = results.produced,
                        expected = vio.block_size(),
                        "fragment decoded to a short block"
                    );
                    vio.set_invalid_fragment();
                    self.shared.stats.record_invalid_fragment(None);
                }
            }
            (Direction::Decompress, Err(status)) => {
                debug!(vio = vio.id(), channel, %status, "decompression failed in hardware");
                vio.set_invalid_fragment();
                self.shared
                    .stats
                    .record_invalid_fragment(Some(IncompressibleReason::HardwareFailure));
            }
        }

        drop(session);
        self.shared.stats.record_completion(submitted_at.elapsed());
        drop(inflight);
        vio.enqueue_callback();
    }

    fn finish_compress(
        &self,
        session: &dyn Session,
        vio: &mut DataVio,
        results: &mut DcResults,
        header_size: usize,
    ) {
        let block_size = vio.block_size();
        let page_size = self.shared.config.page_size;
        let produced = results.produced;

        let rejected = if produced + header_size + ZLIB_FOOTER_SIZE > block_size {
            Some(IncompressibleReason::OverBudget)
        } else if ((produced + header_size) % page_size) + ZLIB_FOOTER_SIZE > page_size {
            Some(IncompressibleReason::PageBoundary)
        } else {
            None
        };
        if let Some(reason) = rejected {
            trace!(vio = vio.id(), produced, %reason, "incompressible");
            vio.set_incompressible();
            self.shared.stats.record_incompressible(reason);
            return;
        }

        let footer_at = header_size + produced;
        results.produced = 0;
        let footer = &mut vio.scratch_block_mut()[footer_at..footer_at + ZLIB_FOOTER_SIZE];
        match session.generate_footer(footer, results) {
            Ok(()) => {
                let size = produced + results.produced + header_size;
                vio.set_compressed(size);
                self.shared.stats.record_compressed(block_size, size);
            }
            Err(status) => {
                debug!(vio = vio.id(), %status, "footer generation failed");
                vio.set_incompressible();
                self.shared
                    .stats
                    .record_incompressible(IncompressibleReason::FooterFailed);
            }
        }
    }

    /// Resolve a request the accelerator refused at submission.
    pub(crate) fn fail_request(&self, request: Box<Request>, reason: IncompressibleReason) {
        let Request {
            direction,
            source,
            destination,
            spare,
            vio,
            inflight,
            ..
        } = *request;

        drop(source);
        drop(destination);
        drop(spare);

        self.resolve_failure(direction, vio, inflight, Some(reason));
    }

    /// Resolve a context whose request could not be built or issued, and
    /// forward it.
    pub(crate) fn resolve_failure(
        &self,
        direction: Direction,
        mut vio: DataVio,
        inflight: InflightGuard,
        cause: Option<IncompressibleReason>,
    ) {
        match direction {
            Direction::Compress => {
                vio.set_incompressible();
                self.shared
                    .stats
                    .record_incompressible(cause.unwrap_or(IncompressibleReason::HardwareFailure));
            }
            Direction::Decompress => {
                vio.set_invalid_fragment();
                self.shared.stats.record_invalid_fragment(cause);
            }
        }
        drop(inflight);
        vio.enqueue_callback();
    }
}

/// How a submission-time error is accounted.
pub(crate) fn failure_cause(error: &Error) -> Option<IncompressibleReason> {
    match error {
        Error::ResourceExhausted { .. } => Some(IncompressibleReason::ResourceExhausted),
        Error::Rejected { .. } => Some(IncompressibleReason::Rejected),
        Error::InvalidFragment(_) => None,
        _ => Some(IncompressibleReason::HardwareFailure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_cause() {
        let e = Error::ResourceExhausted {
            size: 64,
            reason: "limit".into(),
        };
        assert_eq!(failure_cause(&e), Some(IncompressibleReason::ResourceExhausted));
        assert_eq!(failure_cause(&Error::InvalidFragment("short".into())), None);
        assert_eq!(
            failure_cause(&Error::accel("generate_header", crate::accel::AccelStatus::Overflow)),
            Some(IncompressibleReason::HardwareFailure)
        );
    }
}
