//! Error types for the compression offload engine

use thiserror::Error;

use crate::accel::AccelStatus;
use crate::vio::DataVio;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the offload engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The accelerator pool is not ready (uninitialized, disabled or draining)
    #[error("Compression offload unavailable: {0}")]
    OffloadUnavailable(String),

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Contiguous (DMA) allocation failed
    #[error("Resource exhausted allocating {size} bytes: {reason}")]
    ResourceExhausted { size: usize, reason: String },

    // =========================================================================
    // Accelerator Errors
    // =========================================================================
    /// An accelerator API call returned a failure status
    #[error("Accelerator {op} failed: {status}")]
    Accelerator { op: &'static str, status: AccelStatus },

    /// The accelerator refused a job at submission time
    #[error("Accelerator rejected submission: {status}")]
    Rejected { status: AccelStatus },

    /// A compressed fragment could not be decoded
    #[error("Invalid compressed fragment: {0}")]
    InvalidFragment(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Software Codec Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an accelerator call failure.
    pub fn accel(op: &'static str, status: AccelStatus) -> Self {
        Error::Accelerator { op, status }
    }

    /// Whether this error means "take the software path", as opposed to a
    /// request that was already resolved by the engine.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::OffloadUnavailable(_))
    }
}

/// Failure returned synchronously by a submission.
///
/// `Unavailable` hands the untouched context back so the caller can run the
/// software codec instead. `Failed` means the request was already resolved
/// (incompressible or invalid fragment) and forwarded to its continuation;
/// the error is informational.
#[derive(Debug)]
pub enum SubmitError {
    /// Offload is not usable right now; the I/O context is returned.
    Unavailable(Box<DataVio>),

    /// The request failed before reaching the hardware and has already been
    /// completed through its continuation.
    Failed(Error),
}

impl SubmitError {
    /// Recover the I/O context from an `Unavailable` rejection.
    pub fn into_vio(self) -> Option<DataVio> {
        match self {
            SubmitError::Unavailable(vio) => Some(*vio),
            SubmitError::Failed(_) => None,
        }
    }
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Unavailable(vio) => {
                write!(f, "offload unavailable for vio {}", vio.id())
            }
            SubmitError::Failed(e) => write!(f, "submission failed: {}", e),
        }
    }
}

impl std::error::Error for SubmitError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::accel("start_instance", AccelStatus::Resource);
        assert!(err.to_string().contains("start_instance"));

        let err = Error::ResourceExhausted {
            size: 4096,
            reason: "limit reached".into(),
        };
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(Error::OffloadUnavailable("draining".into()).is_unavailable());
        assert!(!Error::Rejected {
            status: AccelStatus::Retry
        }
        .is_unavailable());
    }
}
