//! Page compression for the RAM tier.
//!
//! Pages are zstd-compressed on the way in. All-zero pages are recognised and
//! stored as a flag only, and pages that zstd cannot shrink are kept raw.

use bytes::Bytes;
use thiserror::Error;

use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Page is {len} bytes, expected {expected}")]
    BadPageSize { len: usize, expected: usize },

    #[error("Payload decoded to {len} bytes, expected {expected}")]
    CorruptPayload { len: usize, expected: usize },
}

/// Result of encoding one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// Every byte of the page is zero; nothing to store.
    Zero,
    /// zstd frame.
    Compressed(Bytes),
    /// Page copied verbatim because compression did not help.
    Raw(Bytes),
}

impl Encoded {
    /// Stored size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Encoded::Zero => 0,
            Encoded::Compressed(b) | Encoded::Raw(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The compression engine for fixed-size pages.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
    page_size: usize,
}

impl Compressor {
    pub fn new(config: CompressionConfig, page_size: usize) -> Self {
        Self { config, page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Encode one page for storage.
    pub fn compress(&self, page: &[u8]) -> Result<Encoded, CompressionError> {
        if page.len() != self.page_size {
            return Err(CompressionError::BadPageSize {
                len: page.len(),
                expected: self.page_size,
            });
        }
        if page.iter().all(|&b| b == 0) {
            return Ok(Encoded::Zero);
        }

        let compressed = zstd::encode_all(page, self.config.zstd_level)?;
        if compressed.len() >= self.page_size {
            Ok(Encoded::Raw(Bytes::copy_from_slice(page)))
        } else {
            Ok(Encoded::Compressed(Bytes::from(compressed)))
        }
    }

    /// Decode a stored payload back into a full page.
    pub fn decompress(&self, payload: &[u8], raw: bool) -> Result<Vec<u8>, CompressionError> {
        let page = if raw {
            payload.to_vec()
        } else {
            zstd::decode_all(payload)?
        };
        if page.len() != self.page_size {
            return Err(CompressionError::CorruptPayload {
                len: page.len(),
                expected: self.page_size,
            });
        }
        Ok(page)
    }

    pub fn zero_page(&self) -> Vec<u8> {
        vec![0u8; self.page_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor() -> Compressor {
        Compressor::new(CompressionConfig::default(), 4096)
    }

    #[test]
    fn test_zstd_roundtrip() {
        let c = compressor();
        let page: Vec<u8> = (0..4096).map(|i| (i % 7) as u8).collect();

        let encoded = c.compress(&page).unwrap();
        let Encoded::Compressed(payload) = encoded else {
            panic!("expected a compressed payload");
        };
        assert!(payload.len() < page.len());
        assert_eq!(c.decompress(&payload, false).unwrap(), page);
    }

    #[test]
    fn test_zero_page_detected() {
        let c = compressor();
        assert_eq!(c.compress(&c.zero_page()).unwrap(), Encoded::Zero);
    }

    #[test]
    fn test_incompressible_kept_raw() {
        let c = compressor();
        // xorshift noise does not compress.
        let mut x = 0x2545F4914F6CDD1Du64;
        let page: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect();

        let encoded = c.compress(&page).unwrap();
        let Encoded::Raw(payload) = encoded else {
            panic!("expected a raw payload");
        };
        assert_eq!(c.decompress(&payload, true).unwrap(), page);
    }

    #[test]
    fn test_wrong_page_size_rejected() {
        let c = compressor();
        assert!(matches!(
            c.compress(&[1u8; 100]),
            Err(CompressionError::BadPageSize { len: 100, .. })
        ));
    }
}
