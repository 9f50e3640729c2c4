//! Chunk checksums carried in `Upload-Checksum`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash algorithms accepted for chunk verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Parse an algorithm name as it appears on the wire (case-insensitive).
    pub fn parse(name: &str) -> crate::Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(crate::Error::UnsupportedChecksum(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Length of the raw digest in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Compute the digest of `data`.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `Upload-Checksum` header: an algorithm and the expected digest.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkChecksum {
    algorithm: ChecksumAlgorithm,
    expected: Vec<u8>,
}

impl ChunkChecksum {
    pub fn new(algorithm: ChecksumAlgorithm, expected: Vec<u8>) -> Self {
        Self {
            algorithm,
            expected,
        }
    }

    /// Parse `<algorithm> <base64 digest>`.
    pub fn parse(header: &str) -> crate::Result<Self> {
        let mut parts = header.split_whitespace();
        let (Some(name), Some(encoded), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(crate::Error::InvalidChecksum(format!(
                "expected '<algorithm> <base64>', got '{header}'"
            )));
        };

        let algorithm = ChecksumAlgorithm::parse(name)?;
        let expected = STANDARD
            .decode(encoded)
            .map_err(|e| crate::Error::InvalidChecksum(e.to_string()))?;
        if expected.len() != algorithm.digest_len() {
            return Err(crate::Error::InvalidChecksum(format!(
                "{algorithm} digest must be {} bytes, got {}",
                algorithm.digest_len(),
                expected.len()
            )));
        }

        Ok(Self {
            algorithm,
            expected,
        })
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Expected digest, base64 encoded.
    pub fn expected_base64(&self) -> String {
        STANDARD.encode(&self.expected)
    }

    /// Verify `data` against the expected digest.
    pub fn verify(&self, data: &[u8]) -> crate::Result<()> {
        let actual = self.algorithm.digest(data);
        if actual != self.expected {
            return Err(crate::Error::ChecksumMismatch {
                algorithm: self.algorithm.to_string(),
                expected: self.expected_base64(),
                actual: STANDARD.encode(actual),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkChecksum({} {})", self.algorithm, self.expected_base64())
    }
}
