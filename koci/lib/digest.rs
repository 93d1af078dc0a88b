//! Self-describing content hashes and their streaming hashers.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256, Sha512};

use crate::KociError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The content hash algorithms supported by the store and the registry client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-256, with a 64-character hex encoding.
    Sha256,

    /// SHA-512, with a 128-character hex encoding.
    Sha512,
}

/// A self-describing content hash of the form `<algorithm>:<hex>`.
///
/// The hex component is normalized to lowercase on construction, so derived
/// equality is case-insensitive with respect to the input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

/// A streaming hasher producing a [`Digest`] for one of the supported algorithms.
pub enum DigestHasher {
    /// A running SHA-256 computation.
    Sha256(Sha256),

    /// A running SHA-512 computation.
    Sha512(Sha512),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DigestAlgorithm {
    /// Returns the registered algorithm name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Returns the expected length of the hex encoding for this algorithm.
    pub fn hex_length(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    /// Creates a fresh streaming hasher for this algorithm.
    pub fn hasher(&self) -> DigestHasher {
        match self {
            DigestAlgorithm::Sha256 => DigestHasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => DigestHasher::Sha512(Sha512::new()),
        }
    }
}

impl Digest {
    /// Creates a digest from raw hash bytes produced by `algorithm`.
    pub fn new(algorithm: DigestAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            hex: hex::encode(bytes),
        }
    }

    /// Returns the algorithm component.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns the lowercase hex component.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl DigestHasher {
    /// Feeds bytes into the running hash.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            DigestHasher::Sha256(hasher) => hasher.update(bytes),
            DigestHasher::Sha512(hasher) => hasher.update(bytes),
        }
    }

    /// Consumes the hasher and returns the resulting digest.
    pub fn finalize(self) -> Digest {
        match self {
            DigestHasher::Sha256(hasher) => {
                Digest::new(DigestAlgorithm::Sha256, &hasher.finalize())
            }
            DigestHasher::Sha512(hasher) => {
                Digest::new(DigestAlgorithm::Sha512, &hasher.finalize())
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for DigestAlgorithm {
    type Err = KociError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(KociError::InvalidDigest(format!(
                "unknown algorithm: {}",
                other
            ))),
        }
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Digest {
    type Err = KociError;

    /// Parses the `<algorithm>:<hex>` form, validating the overall grammar,
    /// the algorithm name and the hex length for that algorithm.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let grammar = Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]+$").unwrap();
        if !grammar.is_match(s) {
            return Err(KociError::InvalidDigest(format!(
                "malformed digest: {}",
                s
            )));
        }

        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| KociError::InvalidDigest(format!("missing algorithm prefix: {}", s)))?;
        let algorithm: DigestAlgorithm = algorithm.parse()?;

        if hex.len() != algorithm.hex_length() {
            return Err(KociError::InvalidDigest(format!(
                "expected {} hex characters for {}, got {}",
                algorithm.hex_length(),
                algorithm,
                hex.len()
            )));
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KociError::InvalidDigest(format!(
                "non-hex characters in: {}",
                s
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
