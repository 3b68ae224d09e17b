//! Submission Path
//!
//! Builds a [`Request`] for one context, picks a channel and issues the job
//! asynchronously. The caller's thread never waits for the accelerator.
//!
//! Outcomes of a submission:
//!
//! - `Ok(())` - the job is in flight; the context comes back through its
//!   continuation
//! - `Err(SubmitError::Unavailable(vio))` - the pool is not ready; the
//!   untouched context is returned for the software path
//! - `Err(SubmitError::Failed(e))` - the request could not be built or was
//!   refused; the context was already resolved (incompressible / invalid
//!   fragment) and forwarded

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::completion::{failure_cause, CompletionHandler};
use crate::dma::SpareBuffer;
use crate::envelope::ZLIB_HEADER_SIZE;
use crate::error::{Error, Result, SubmitError};
use crate::pool::{AcceleratorPool, Channel, InflightGuard};
use crate::request::{Direction, Request};
use crate::sgl::{segment_estimate, FlatBuffer, ScatterGatherList, SgListBuilder};
use crate::stats::IncompressibleReason;
use crate::vio::{DataVio, VioOperation};

/// Lists and buffers built for one request before the context moves in.
struct Prepared {
    source: ScatterGatherList,
    destination: ScatterGatherList,
    spare: Option<SpareBuffer>,
    header_size: usize,
}

impl AcceleratorPool {
    /// Submit a context by its operation: writes compress, reads decompress.
    pub fn submit(&self, vio: DataVio) -> std::result::Result<(), SubmitError> {
        match vio.operation() {
            VioOperation::Write => self.compress(vio),
            VioOperation::Read => self.decompress(vio),
        }
    }

    /// Compress the context's data block into its scratch block.
    #[instrument(skip(self, vio), fields(vio = vio.id()))]
    pub fn compress(&self, vio: DataVio) -> std::result::Result<(), SubmitError> {
        self.issue(Direction::Compress, vio)
    }

    /// Decode the context's stored fragment into its scratch block.
    #[instrument(skip(self, vio), fields(vio = vio.id()))]
    pub fn decompress(&self, vio: DataVio) -> std::result::Result<(), SubmitError> {
        self.issue(Direction::Decompress, vio)
    }

    fn issue(&self, direction: Direction, mut vio: DataVio) -> std::result::Result<(), SubmitError> {
        let stats = &self.shared.stats;
        let (inflight, channel) = match self.begin_request() {
            Some(inflight) => match self.select_channel() {
                Some(channel) => (inflight, channel),
                None => {
                    stats.record_unavailable();
                    return Err(SubmitError::Unavailable(Box::new(vio)));
                }
            },
            None => {
                stats.record_unavailable();
                return Err(SubmitError::Unavailable(Box::new(vio)));
            }
        };

        stats.record_submit(direction);

        let prepared = match direction {
            Direction::Compress => self.prepare_compress(channel, &mut vio),
            Direction::Decompress => self.prepare_decompress(channel, &mut vio),
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(vio = vio.id(), channel = channel.index(), error = %e, "request setup failed");
                return Err(self.fail_unbuilt(direction, vio, inflight, e));
            }
        };

        channel.record_job();
        let request = Box::new(Request {
            direction,
            channel: channel.index(),
            session: Arc::clone(channel.session()),
            source: prepared.source,
            destination: prepared.destination,
            spare: prepared.spare,
            results: Default::default(),
            header_size: prepared.header_size,
            vio,
            submitted_at: Instant::now(),
            inflight,
        });

        let issued = match direction {
            Direction::Compress => channel.session().compress_data(request),
            Direction::Decompress => channel.session().decompress_data(request),
        };
        issued.map_err(|rejected| {
            let status = rejected.status;
            debug!(channel = channel.index(), %status, "accelerator refused submission");
            CompletionHandler::new(Arc::clone(&self.shared))
                .fail_request(rejected.request, IncompressibleReason::Rejected);
            SubmitError::Failed(Error::Rejected { status })
        })
    }

    fn fail_unbuilt(
        &self,
        direction: Direction,
        vio: DataVio,
        inflight: InflightGuard,
        error: Error,
    ) -> SubmitError {
        CompletionHandler::new(Arc::clone(&self.shared)).resolve_failure(
            direction,
            vio,
            inflight,
            failure_cause(&error),
        );
        SubmitError::Failed(error)
    }

    /// Source: the data block. Destination: the scratch block past the
    /// envelope header, then one spare block.
    fn prepare_compress(&self, channel: &Channel, vio: &mut DataVio) -> Result<Prepared> {
        let page_shift = self.shared.config.page_shift();
        let block_size = vio.block_size();
        let mut spare = self.shared.spare.get()?;

        let header_size = channel
            .session()
            .generate_header(vio.scratch_block_mut())
            .map_err(|status| Error::accel("generate_header", status))?;

        let source = FlatBuffer::from_slice(vio.data_block_mut());
        let primary = FlatBuffer::from_slice(vio.scratch_block_mut());
        let overflow = spare.segment();

        let builder =
            SgListBuilder::new(&self.shared.allocator, self.accelerator().as_ref(), channel.index());
        let (source, mut destination) = builder.build_pair(
            &[source],
            segment_estimate(block_size, page_shift),
            &[primary, overflow],
            segment_estimate(block_size + spare.len(), page_shift),
        )?;
        destination.advance_first(header_size)?;

        Ok(Prepared {
            source,
            destination,
            spare: Some(spare),
            header_size,
        })
    }

    /// Source: the stored fragment past its envelope header. Destination:
    /// the scratch block.
    fn prepare_decompress(&self, channel: &Channel, vio: &mut DataVio) -> Result<Prepared> {
        let page_shift = self.shared.config.page_shift();
        let fragment_len = vio.fragment().len();
        if fragment_len <= ZLIB_HEADER_SIZE {
            return Err(Error::InvalidFragment(format!(
                "fragment of {} bytes has no payload",
                fragment_len
            )));
        }

        let source = FlatBuffer::from_slice(vio.fragment_mut());
        let output = FlatBuffer::from_slice(vio.scratch_block_mut());

        let builder =
            SgListBuilder::new(&self.shared.allocator, self.accelerator().as_ref(), channel.index());
        let (mut source, destination) = builder.build_pair(
            &[source],
            segment_estimate(fragment_len, page_shift),
            &[output],
            segment_estimate(vio.block_size(), page_shift),
        )?;
        source.advance_first(ZLIB_HEADER_SIZE)?;

        Ok(Prepared {
            source,
            destination,
            spare: None,
            header_size: ZLIB_HEADER_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::emulated::EmulatedAccelerator;
    use crate::config::OffloadConfig;
    use crate::dma::DmaBuf;
    use crate::vio::{Continuation, ReadStatus};
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    fn pool(instances: usize) -> (Arc<EmulatedAccelerator>, AcceleratorPool) {
        let accel = Arc::new(EmulatedAccelerator::with_instances(instances));
        let config = OffloadConfig {
            spare_cache_initial: 2,
            spare_cache_capacity: 16,
            ..Default::default()
        };
        let pool = AcceleratorPool::try_initialize(accel.clone(), config).unwrap();
        (accel, pool)
    }

    fn text_block() -> DmaBuf {
        let text = b"the quick brown fox jumps over the lazy dog. ";
        let data: Vec<u8> = text.iter().cycle().take(4096).copied().collect();
        DmaBuf::from_slice(&data).unwrap()
    }

    #[tokio::test]
    async fn test_compress_completes_through_queue() {
        let (_accel, pool) = pool(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let vio = DataVio::for_write(1, text_block(), Continuation::Queue(tx)).unwrap();

        pool.compress(vio).unwrap();
        let done = rx.recv().await.unwrap();
        assert!(!done.is_incompressible());
        let envelope = done.compressed_data().unwrap();
        assert_eq!(&envelope[..2], &[0x78, 0x01]);
        assert!(envelope.len() < 4096);
    }

    #[tokio::test]
    async fn test_short_fragment_is_invalid() {
        let (_accel, pool) = pool(1);
        let baseline = pool.allocator().live_allocations();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stored = DmaBuf::new(4096).unwrap();
        let vio = DataVio::for_read(7, stored, 0..2, 4096, Continuation::Queue(tx)).unwrap();

        let err = pool.decompress(vio).unwrap_err();
        assert_matches!(err, SubmitError::Failed(Error::InvalidFragment(_)));
        let done = rx.recv().await.unwrap();
        assert_eq!(done.read_block().status, ReadStatus::InvalidFragment);
        assert_eq!(pool.allocator().live_allocations(), baseline);
        assert_eq!(pool.inflight(), 0);
        assert_eq!(pool.channel_jobs(), vec![0]);
    }

    #[tokio::test]
    async fn test_unavailable_returns_context() {
        let (_accel, pool) = pool(1);
        pool.shutdown();
        let (tx, _rx) = mpsc::unbounded_channel();
        let vio = DataVio::for_write(9, text_block(), Continuation::Queue(tx)).unwrap();

        let err = pool.compress(vio).unwrap_err();
        let vio = err.into_vio().unwrap();
        assert_eq!(vio.id(), 9);
        assert_eq!(vio.compression().size, 0);
        assert_eq!(pool.stats().snapshot().unavailable, 1);
    }
}
