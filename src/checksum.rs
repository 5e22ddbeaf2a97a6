use std::fmt;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Digest algorithm behind a [`ContentChecksum`].
///
/// Only BLAKE3 exists today; the identifier is persisted in payload headers
/// so a future algorithm change is detectable rather than a silent mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Blake3,
}

impl DigestAlgorithm {
    /// Digest output size in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlgorithm::Blake3 => 32,
        }
    }
}

/// Identifies one exact version of a file's contents: algorithm, digest,
/// and source length. Two checksums are equal iff all three fields match;
/// differing algorithms compare unequal unconditionally.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentChecksum {
    algorithm: DigestAlgorithm,
    digest: [u8; 32],
    length: u64,
}

impl ContentChecksum {
    /// Hash an in-memory byte buffer.
    pub fn compute(data: &[u8]) -> Self {
        Self {
            algorithm: DigestAlgorithm::Blake3,
            digest: *blake3::hash(data).as_bytes(),
            length: data.len() as u64,
        }
    }

    /// Stream-hash a reader without buffering the whole input.
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let length = std::io::copy(&mut reader, &mut hasher)?;
        Ok(Self {
            algorithm: DigestAlgorithm::Blake3,
            digest: *hasher.finalize().as_bytes(),
            length,
        })
    }

    /// Stream-hash a file. Uses a 256 KB BufReader to reduce syscall
    /// overhead vs the default 8 KB.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
        let reader = std::io::BufReader::with_capacity(256 * 1024, file);
        Self::from_reader(reader)
            .with_context(|| format!("Failed to hash file: {}", path.display()))
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// True when both checksums were produced by the same digest algorithm.
    /// A foreign algorithm means "unknown version", never "mismatch".
    pub fn same_algorithm(&self, other: &ContentChecksum) -> bool {
        self.algorithm == other.algorithm
    }

    /// Lowercase hex rendering of the digest, fixed width per algorithm.
    /// This is the form embedded in repository entry filenames.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

impl fmt::Debug for ContentChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentChecksum")
            .field("algorithm", &self.algorithm)
            .field("digest", &self.digest_hex())
            .field("length", &self.length)
            .finish()
    }
}

impl fmt::Display for ContentChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.digest_hex(), self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_deterministic() {
        let a = ContentChecksum::compute(b"Hello, World!");
        let b = ContentChecksum::compute(b"Hello, World!");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_content_differs() {
        let a = ContentChecksum::compute(b"Hello");
        let b = ContentChecksum::compute(b"World");
        assert_ne!(a, b);
    }

    #[test]
    fn test_length_recorded() {
        let sum = ContentChecksum::compute(&[0u8; 4096]);
        assert_eq!(sum.length(), 4096);
    }

    #[test]
    fn test_streaming_matches_buffered() {
        let data = vec![7u8; 300 * 1024];
        let buffered = ContentChecksum::compute(&data);
        let streamed = ContentChecksum::from_reader(&data[..]).unwrap();
        assert_eq!(buffered, streamed);
    }

    #[test]
    fn test_hex_width() {
        let sum = ContentChecksum::compute(b"x");
        let hex = sum.digest_hex();
        assert_eq!(hex.len(), DigestAlgorithm::Blake3.digest_len() * 2);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
