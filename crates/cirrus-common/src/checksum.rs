//! Checksum utilities for Cirrus
//!
//! Cloud backends report an object checksum in one of a small set of
//! algorithms; the cache fill computes all of them incrementally over the
//! bytes as they are written and verifies the one that was reported.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A checksum as reported by a cloud backend for one object
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checksum {
    /// CRC32C (Castagnoli), as reported by Google Cloud Storage
    Crc32c(u32),
    /// SHA256, as reported by S3 checksum-mode responses
    Sha256([u8; 32]),
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32c(v) => write!(f, "crc32c:{v:08x}"),
            Self::Sha256(d) => write!(f, "sha256:{}", hex::encode(d)),
        }
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

/// Digests computed over an entire transfer
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Digests {
    pub crc32c: u32,
    pub sha256: [u8; 32],
}

impl Digests {
    /// Check the computed digests against a reported checksum
    #[must_use]
    pub fn matches(&self, reported: &Checksum) -> bool {
        match reported {
            Checksum::Crc32c(v) => self.crc32c == *v,
            Checksum::Sha256(d) => &self.sha256 == d,
        }
    }

    /// Render the digest for the algorithm the reported checksum used
    #[must_use]
    pub fn render_for(&self, reported: &Checksum) -> String {
        match reported {
            Checksum::Crc32c(_) => format!("crc32c:{:08x}", self.crc32c),
            Checksum::Sha256(_) => format!("sha256:{}", hex::encode(self.sha256)),
        }
    }
}

/// Streaming digest calculator
pub struct DigestBuilder {
    crc32c: u32,
    sha256: Sha256,
    bytes: u64,
}

impl DigestBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            sha256: Sha256::new(),
            bytes: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.sha256.update(data);
        self.bytes += data.len() as u64;
    }

    /// Total bytes fed in so far
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the computed digests
    #[must_use]
    pub fn finalize(self) -> Digests {
        Digests {
            crc32c: self.crc32c,
            sha256: self.sha256.finalize().into(),
        }
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot SHA256 checksum of a byte slice
#[must_use]
pub fn sha256_of(data: &[u8]) -> Checksum {
    Checksum::Sha256(Sha256::digest(data).into())
}

/// One-shot CRC32C checksum of a byte slice
#[must_use]
pub fn crc32c_of(data: &[u8]) -> Checksum {
    Checksum::Crc32c(crc32c::crc32c(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = b"hello, world!";

        let mut builder = DigestBuilder::new();
        builder.update(b"hello, ");
        builder.update(b"world!");
        let digests = builder.finalize();

        assert!(digests.matches(&sha256_of(data)));
        assert!(digests.matches(&crc32c_of(data)));
        assert_eq!(digests.crc32c, crc32c::crc32c(data));
    }

    #[test]
    fn test_mismatch_detected() {
        let mut builder = DigestBuilder::new();
        builder.update(b"hello, world?");
        let digests = builder.finalize();

        assert!(!digests.matches(&sha256_of(b"hello, world!")));
        assert!(!digests.matches(&crc32c_of(b"hello, world!")));
    }

    #[test]
    fn test_bytes_counted() {
        let mut builder = DigestBuilder::new();
        builder.update(&[0u8; 100]);
        builder.update(&[0u8; 28]);
        assert_eq!(builder.bytes(), 128);
    }

    #[test]
    fn test_display() {
        let c = Checksum::Crc32c(0xdead_beef);
        assert_eq!(c.to_string(), "crc32c:deadbeef");
    }
}
