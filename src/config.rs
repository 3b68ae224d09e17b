//! Engine configuration
//!
//! [`OffloadConfig`] is the resolved configuration handed to the pool. It is
//! usually built from defaults, optionally loaded from a YAML file, and then
//! overridden by command-line flags.
//!
//! ```yaml
//! block_size: 4096
//! max_channels: 8
//! compression_level: 1
//! memory_limit: 67108864
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Storage block size (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Host page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest buffer the accelerator is used for
pub const MIN_OFFLOAD_SIZE: usize = 4 * 1024;

/// Largest buffer the accelerator is used for
pub const MAX_OFFLOAD_SIZE: usize = 128 * 1024;

/// Maximum number of accelerator channels used
pub const MAX_CHANNELS: usize = 48;

/// Default deflate level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;

/// Intermediate buffer size as a multiple of the largest offloaded buffer
pub const DEFAULT_INTERMEDIATE_FACTOR: usize = 2;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the offload engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Storage block size; the incompressible sentinel is `block_size + 1`
    pub block_size: usize,

    /// Page size used for the footer boundary check and segment estimates
    pub page_size: usize,

    /// Smallest eligible buffer
    pub min_offload_size: usize,

    /// Largest eligible buffer
    pub max_offload_size: usize,

    /// Cap on channels taken from the device (0 disables offload)
    pub max_channels: usize,

    /// Deflate level for every session
    pub compression_level: u32,

    /// Intermediate buffer size = factor x `max_offload_size`
    pub intermediate_buffer_factor: usize,

    /// Spare buffers allocated up front
    pub spare_cache_initial: usize,

    /// Idle spare buffers kept
    pub spare_cache_capacity: usize,

    /// Byte cap on contiguous allocations (None = unlimited)
    pub memory_limit: Option<usize>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            min_offload_size: MIN_OFFLOAD_SIZE,
            max_offload_size: MAX_OFFLOAD_SIZE,
            max_channels: MAX_CHANNELS,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            intermediate_buffer_factor: DEFAULT_INTERMEDIATE_FACTOR,
            spare_cache_initial: 64,
            spare_cache_capacity: 1024,
            memory_limit: None,
        }
    }
}

impl OffloadConfig {
    /// Create a config with offload disabled.
    pub fn disabled() -> Self {
        Self {
            max_channels: 0,
            ..Default::default()
        }
    }

    /// Create a config for memory-constrained hosts.
    pub fn low_memory() -> Self {
        Self {
            max_channels: 4,
            spare_cache_initial: 8,
            spare_cache_capacity: 64,
            memory_limit: Some(16 * 1024 * 1024),
            ..Default::default()
        }
    }

    /// Create a config for high submission rates.
    pub fn throughput() -> Self {
        Self {
            spare_cache_initial: 512,
            spare_cache_capacity: 4096,
            ..Default::default()
        }
    }

    /// Load from a YAML file. Missing fields take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// `log2(page_size)`.
    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Size of each per-channel intermediate buffer.
    pub fn intermediate_buffer_size(&self) -> usize {
        self.intermediate_buffer_factor * self.max_offload_size
    }

    /// Whether a buffer of `len` bytes falls in the eligibility window.
    pub fn in_offload_window(&self, len: usize) -> bool {
        (self.min_offload_size..=self.max_offload_size).contains(&len)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(Error::Config("page_size must be a power of two".into()));
        }
        if !self.block_size.is_power_of_two() {
            return Err(Error::Config("block_size must be a power of two".into()));
        }
        if self.min_offload_size == 0 || self.min_offload_size > self.max_offload_size {
            return Err(Error::Config(
                "min_offload_size must be > 0 and <= max_offload_size".into(),
            ));
        }
        if self.max_channels > MAX_CHANNELS {
            return Err(Error::Config(format!(
                "max_channels must be <= {}",
                MAX_CHANNELS
            )));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(Error::Config(
                "compression_level must be between 1 and 9".into(),
            ));
        }
        if self.intermediate_buffer_factor == 0 {
            return Err(Error::Config(
                "intermediate_buffer_factor must be > 0".into(),
            ));
        }
        if self.spare_cache_initial > self.spare_cache_capacity {
            return Err(Error::Config(
                "spare_cache_initial must be <= spare_cache_capacity".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config() {
        let config = OffloadConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_shift(), 12);
        assert_eq!(config.intermediate_buffer_size(), 262144);
        assert!(config.in_offload_window(4096));
        assert!(config.in_offload_window(131072));
        assert!(!config.in_offload_window(4095));
        assert!(!config.in_offload_window(131073));
    }

    #[test]
    fn test_presets_validate() {
        assert!(OffloadConfig::disabled().validate().is_ok());
        assert!(OffloadConfig::low_memory().validate().is_ok());
        assert!(OffloadConfig::throughput().validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let config = OffloadConfig {
            compression_level: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let config = OffloadConfig {
            page_size: 3000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OffloadConfig {
            max_channels: 49,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = OffloadConfig::from_yaml_str("max_channels: 8\nmemory_limit: 1048576\n").unwrap();
        assert_eq!(config.max_channels, 8);
        assert_eq!(config.memory_limit, Some(1048576));
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_from_yaml_rejects_bad_values() {
        assert_matches!(
            OffloadConfig::from_yaml_str("compression_level: 12\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            OffloadConfig::from_yaml_str("block_size: [1, 2]\n"),
            Err(Error::ConfigParse(_))
        );
    }
}
