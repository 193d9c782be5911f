//! Content digests.
//!
//! Parses and canonicalizes `algorithm:hex` identifiers, derives filesystem-safe
//! names from them and verifies content against them.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use layerfold_core::error::{FoldError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};

/// Hash algorithms accepted in digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Algorithm name as it appears in a digest string.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Number of hex characters in an encoded hash.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated content digest.
///
/// The hex part is always lowercase and has the length required by the algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Parse a digest string such as `sha256:e3b0c442...`.
    ///
    /// Uppercase hex is accepted and normalized to lowercase.
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = |reason: String| FoldError::MalformedDigest {
            value: raw.to_string(),
            reason,
        };

        let (algorithm, hex) = raw
            .split_once(':')
            .ok_or_else(|| malformed("expected algorithm:hex".to_string()))?;

        let algorithm = DigestAlgorithm::from_name(algorithm)
            .ok_or_else(|| malformed(format!("unsupported algorithm '{}'", algorithm)))?;

        if hex.len() != algorithm.hex_len() {
            return Err(malformed(format!(
                "expected {} hex characters for {}, got {}",
                algorithm.hex_len(),
                algorithm,
                hex.len()
            )));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed("hex part contains non-hex characters".to_string()));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut hasher = DigestHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    /// Digest of everything a reader yields.
    pub fn of_reader(algorithm: DigestAlgorithm, mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = DigestHasher::new(algorithm);
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Name safe to use as a file or directory name on common filesystems.
    ///
    /// Joins algorithm and hex with `-`; neither part can contain `-`, so distinct
    /// digests always produce distinct names.
    pub fn sanitize_for_filesystem(&self) -> String {
        format!("{}-{}", self.algorithm, self.hex)
    }

    /// Stream `content` through this digest's algorithm and compare.
    pub fn verify(&self, content: impl Read) -> std::io::Result<bool> {
        Ok(Self::of_reader(self.algorithm, content)? == *self)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = FoldError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher producing a [`Digest`].
pub struct DigestHasher {
    inner: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestHasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let inner = match algorithm {
            DigestAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self.inner {
            HasherState::Sha256(h) => Digest {
                algorithm: DigestAlgorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            HasherState::Sha512(h) => Digest {
                algorithm: DigestAlgorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}
