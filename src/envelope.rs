//! Compressed-block envelope
//!
//! Compressed blocks are stored as a zlib stream:
//!
//! ```text
//! ┌────────┬──────────────────────────────┬──────────────────┐
//! │ header │ raw deflate payload          │ footer           │
//! │ 2 B    │ produced bytes               │ Adler-32, BE, 4 B│
//! └────────┴──────────────────────────────┴──────────────────┘
//! ```
//!
//! The offload path builds the envelope piecewise (header from the session,
//! payload from the accelerator, footer after classification). The
//! [`SoftwareCodec`] produces and consumes the same bytes with `flate2`, so a
//! block written by either path can be read by the other.

use std::io::{Read, Write};

use adler2::Adler32;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{instrument, trace};

use crate::error::{Error, Result};
use crate::vio::DataVio;

/// zlib header length
pub const ZLIB_HEADER_SIZE: usize = 2;

/// zlib footer (Adler-32) length
pub const ZLIB_FOOTER_SIZE: usize = 4;

const ZLIB_CMF_DEFLATE_32K: u8 = 0x78;

/// Two-byte zlib header for a deflate stream at `level`.
pub fn zlib_header(level: u32) -> [u8; ZLIB_HEADER_SIZE] {
    let flevel: u8 = match level {
        0 | 1 => 0,
        2..=5 => 1,
        6 => 2,
        _ => 3,
    };
    let cmf = ZLIB_CMF_DEFLATE_32K;
    let flg = flevel << 6;
    let rem = ((cmf as u16) << 8 | flg as u16) % 31;
    let fcheck = if rem == 0 { 0 } else { 31 - rem as u8 };
    [cmf, flg | fcheck]
}

/// Whether `bytes` starts with a valid zlib deflate header.
pub fn is_zlib_header(bytes: &[u8]) -> bool {
    match bytes {
        [cmf, flg, ..] => {
            cmf & 0x0F == 8 && flg & 0x20 == 0 && ((*cmf as u16) << 8 | *flg as u16) % 31 == 0
        }
        _ => false,
    }
}

/// Adler-32 of `data`, continuing from `seed` (1 for a fresh checksum).
pub fn adler32_update(seed: u32, data: &[u8]) -> u32 {
    let mut adler = Adler32::from_checksum(seed);
    adler.write_slice(data);
    adler.checksum()
}

/// Adler-32 of `data`.
pub fn adler32(data: &[u8]) -> u32 {
    adler2::adler32_slice(data)
}

// =============================================================================
// Software codec
// =============================================================================

/// Software zlib codec producing the same envelope as the offload path.
#[derive(Debug, Clone)]
pub struct SoftwareCodec {
    level: u32,
    block_size: usize,
}

impl SoftwareCodec {
    pub fn new(level: u32, block_size: usize) -> Self {
        Self { level, block_size }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Compress `data` into a complete envelope. Returns `None` when the
    /// envelope would not fit in one block.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(self.block_size),
            Compression::new(self.level),
        );
        encoder
            .write_all(data)
            .map_err(|e| Error::CompressionFailed {
                algorithm: "zlib".into(),
                reason: e.to_string(),
            })?;
        let out = encoder.finish().map_err(|e| Error::CompressionFailed {
            algorithm: "zlib".into(),
            reason: e.to_string(),
        })?;

        trace!(input = data.len(), output = out.len(), "software compress");
        if out.len() > self.block_size {
            return Ok(None);
        }
        Ok(Some(out))
    }

    /// Decode an envelope that must expand to exactly `expected_len` bytes.
    #[instrument(skip(self, envelope), fields(compressed_size = envelope.len()))]
    pub fn decompress(&self, envelope: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_len);
        ZlibDecoder::new(envelope)
            .take(expected_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: "zlib".into(),
                reason: e.to_string(),
            })?;

        if out.len() != expected_len {
            return Err(Error::DecompressionFailed {
                algorithm: "zlib".into(),
                reason: format!("expected {} bytes, got {}", expected_len, out.len()),
            });
        }
        Ok(out)
    }

    /// Resolve a write context the way an offload completion would: the
    /// envelope lands in the scratch block, or the context is marked
    /// incompressible.
    pub fn compress_vio(&self, vio: &mut DataVio) -> Result<()> {
        match self.compress(vio.data_block())? {
            Some(envelope) if envelope.len() <= vio.scratch_block().len() => {
                vio.scratch_block_mut()[..envelope.len()].copy_from_slice(&envelope);
                vio.set_compressed(envelope.len());
            }
            _ => vio.set_incompressible(),
        }
        Ok(())
    }

    /// Resolve a read context: the decoded block lands in the scratch block,
    /// or the read is marked as an invalid fragment.
    pub fn decompress_vio(&self, vio: &mut DataVio) -> Result<()> {
        let expected = vio.scratch_block().len();
        match self.decompress(vio.fragment(), expected) {
            Ok(block) => {
                vio.scratch_block_mut().copy_from_slice(&block);
                vio.set_read_success(block.len());
            }
            Err(e) => {
                trace!(error = %e, "software decompress rejected fragment");
                vio.set_invalid_fragment();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_level_one_header() {
        assert_eq!(zlib_header(1), [0x78, 0x01]);
        assert_eq!(zlib_header(6), [0x78, 0x9C]);
        assert_eq!(zlib_header(9), [0x78, 0xDA]);
    }

    #[test]
    fn test_headers_pass_fcheck() {
        for level in 0..=9 {
            assert!(is_zlib_header(&zlib_header(level)), "level {}", level);
        }
        assert!(!is_zlib_header(&[0x78, 0x02]));
        assert!(!is_zlib_header(&[0x78]));
    }

    #[test]
    fn test_adler32_known_values() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
        let big = vec![0xFFu8; 100_000];
        assert_eq!(adler32_update(adler32(&big[..40_000]), &big[40_000..]), adler32(&big));
    }

    #[test]
    fn test_software_round_trip() {
        let codec = SoftwareCodec::new(1, 4096);
        let data: Vec<u8> = (0..4096).map(|i| (i % 64) as u8).collect();
        let env = codec.compress(&data).unwrap().unwrap();
        assert!(is_zlib_header(&env));
        let trailer = &env[env.len() - ZLIB_FOOTER_SIZE..];
        assert_eq!(trailer, adler32(&data).to_be_bytes());
        assert_eq!(codec.decompress(&env, 4096).unwrap(), data);
    }

    #[test]
    fn test_software_incompressible() {
        let codec = SoftwareCodec::new(1, 4096);
        let mut x: u32 = 0x1234_5678;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect();
        assert!(codec.compress(&data).unwrap().is_none());
    }

    #[test]
    fn test_software_rejects_garbage() {
        let codec = SoftwareCodec::new(1, 4096);
        assert_matches!(
            codec.decompress(&[0x78, 0x01, 0xFF, 0xFF], 4096),
            Err(Error::DecompressionFailed { .. })
        );
    }
}
