//! Content hashes used as object identifiers.
//!
//! Every object in the cache is addressed by the hash of its content,
//! tagged with the algorithm that produced it. The wire carries hashes in an
//! untrusted form ([`WireHash`]) whose algorithm tag and digest length are
//! validated before any backend call; a hash that does not parse makes the
//! surrounding request malformed.
use std::fmt;

use bincode::{Decode, Encode};
use thiserror::Error;

/// Widest digest any supported algorithm produces.
pub const MAX_DIGEST_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("unknown hash algorithm tag {0}")]
    UnknownAlgorithm(u32),

    #[error("digest of {actual} bytes does not match {algorithm} ({expected} bytes)")]
    DigestLength {
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },
}

/// Hash algorithms the cache recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Ripemd160,
    Shake128,
}

impl HashAlgorithm {
    /// Digest width in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Ripemd160 => 20,
            HashAlgorithm::Shake128 => 32,
        }
    }

    fn from_tag(tag: u32) -> Result<Self, HashError> {
        match tag {
            1 => Ok(HashAlgorithm::Sha1),
            2 => Ok(HashAlgorithm::Ripemd160),
            3 => Ok(HashAlgorithm::Shake128),
            other => Err(HashError::UnknownAlgorithm(other)),
        }
    }

    fn tag(self) -> u32 {
        match self {
            HashAlgorithm::Sha1 => 1,
            HashAlgorithm::Ripemd160 => 2,
            HashAlgorithm::Shake128 => 3,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha1 => write!(f, "sha1"),
            HashAlgorithm::Ripemd160 => write!(f, "ripemd160"),
            HashAlgorithm::Shake128 => write!(f, "shake128"),
        }
    }
}

/// A validated object identifier: algorithm plus fixed-width digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    algorithm: HashAlgorithm,
    digest: [u8; MAX_DIGEST_LEN],
}

impl ObjectId {
    /// Builds an identifier, rejecting digests whose length does not match
    /// the algorithm.
    pub fn new(algorithm: HashAlgorithm, digest: &[u8]) -> Result<Self, HashError> {
        if digest.len() != algorithm.digest_len() {
            return Err(HashError::DigestLength {
                algorithm,
                expected: algorithm.digest_len(),
                actual: digest.len(),
            });
        }

        let mut padded = [0u8; MAX_DIGEST_LEN];
        padded[..digest.len()].copy_from_slice(digest);
        Ok(Self {
            algorithm,
            digest: padded,
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The digest bytes, trimmed to the algorithm's width.
    pub fn digest(&self) -> &[u8] {
        &self.digest[..self.algorithm.digest_len()]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.digest() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "-{}", self.algorithm)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// Unvalidated wire form of an object identifier.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct WireHash {
    pub algorithm: u32,
    pub digest: Vec<u8>,
}

impl From<&ObjectId> for WireHash {
    fn from(id: &ObjectId) -> Self {
        Self {
            algorithm: id.algorithm.tag(),
            digest: id.digest().to_vec(),
        }
    }
}

impl TryFrom<&WireHash> for ObjectId {
    type Error = HashError;

    fn try_from(wire: &WireHash) -> Result<Self, Self::Error> {
        let algorithm = HashAlgorithm::from_tag(wire.algorithm)?;
        ObjectId::new(algorithm, &wire.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_hash_round_trip() {
        let id = ObjectId::new(HashAlgorithm::Sha1, &[0xab; 20]).unwrap();
        let wire = WireHash::from(&id);
        let parsed = ObjectId::try_from(&wire).unwrap();

        assert_eq!(id, parsed);
        assert_eq!(parsed.digest(), &[0xab; 20]);
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let wire = WireHash {
            algorithm: 99,
            digest: vec![0; 20],
        };

        assert_eq!(
            ObjectId::try_from(&wire),
            Err(HashError::UnknownAlgorithm(99))
        );
    }

    #[test]
    fn digest_length_must_match_algorithm() {
        let wire = WireHash {
            algorithm: 3,
            digest: vec![0; 20],
        };

        assert_eq!(
            ObjectId::try_from(&wire),
            Err(HashError::DigestLength {
                algorithm: HashAlgorithm::Shake128,
                expected: 32,
                actual: 20,
            })
        );
    }

    #[test]
    fn display_is_hex_with_algorithm_suffix() {
        let id = ObjectId::new(HashAlgorithm::Sha1, &[0x0f; 20]).unwrap();
        let rendered = id.to_string();

        assert!(rendered.starts_with("0f0f"));
        assert!(rendered.ends_with("-sha1"));
    }
}
