//! Completion tag for one submitted job.
//!
//! A [`Request`] owns everything a job touches: both descriptor lists and
//! their metadata, the borrowed spare buffer, the result slot and the I/O
//! context. It is boxed at submission, travels through the accelerator as
//! the job's tag, and is consumed by the completion handler. Dropping it
//! releases every allocation it holds.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::accel::{DcResults, Session};
use crate::dma::SpareBuffer;
use crate::pool::InflightGuard;
use crate::sgl::ScatterGatherList;
use crate::vio::DataVio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Compress,
    Decompress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Compress => write!(f, "compress"),
            Direction::Decompress => write!(f, "decompress"),
        }
    }
}

pub struct Request {
    pub(crate) direction: Direction,
    pub(crate) channel: usize,
    pub(crate) session: Arc<dyn Session>,
    pub(crate) source: ScatterGatherList,
    pub(crate) destination: ScatterGatherList,
    pub(crate) spare: Option<SpareBuffer>,
    pub(crate) results: DcResults,
    pub(crate) header_size: usize,
    pub(crate) vio: DataVio,
    pub(crate) submitted_at: Instant,
    pub(crate) inflight: InflightGuard,
}

impl Request {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Index of the channel the job was issued on.
    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn source(&self) -> &ScatterGatherList {
        &self.source
    }

    pub fn destination(&self) -> &ScatterGatherList {
        &self.destination
    }

    pub fn results(&self) -> &DcResults {
        &self.results
    }

    pub fn results_mut(&mut self) -> &mut DcResults {
        &mut self.results
    }

    pub fn vio(&self) -> &DataVio {
        &self.vio
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("direction", &self.direction)
            .field("channel", &self.channel)
            .field("vio", &self.vio.id())
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("spare", &self.spare.is_some())
            .field("results", &self.results)
            .finish()
    }
}
