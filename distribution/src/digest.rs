//! Content digests
//!
//! A [`Digest`] is the algorithm-tagged hash of a byte sequence, written as
//! `<algorithm>:<lowercase hex>`. Because the algorithm is part of the value,
//! the same content under `sha256` and `sha512` yields two distinct digests.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha2::{Digest as _, Sha256, Sha512};
use tokio::io::AsyncWrite;

use crate::error::RegistryError;

/// Hash algorithms a digest can be computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Algorithm {
    /// SHA-256, the canonical algorithm.
    #[default]
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    /// The name used in the textual form of a digest.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Start an incremental hash with this algorithm.
    pub fn digester(&self) -> Digester {
        let hasher = match self {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Digester { hasher }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(RegistryError::InvalidDigest(format!(
                "unsupported algorithm {s:?}"
            ))),
        }
    }
}

/// An algorithm-tagged content identifier.
///
/// Digests are derived from content, never edited. The only ways to build one
/// are hashing bytes or parsing a well-formed string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Hash `data` with `algorithm`.
    pub fn from_bytes(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut digester = algorithm.digester();
        digester.update(data);
        digester.finalize()
    }

    /// Hash `data` with SHA-256.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_bytes(Algorithm::Sha256, data)
    }

    /// The algorithm half of the digest.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex half of the digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Recompute the digest of `data` and compare.
    pub fn verify(&self, data: &[u8]) -> bool {
        Digest::from_bytes(self.algorithm, data) == *self
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| RegistryError::InvalidDigest(s.to_string()))?;
        let algorithm: Algorithm = algorithm.parse()?;

        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(RegistryError::InvalidDigest(s.to_string()));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Clone)]
enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental hasher producing a [`Digest`].
#[derive(Clone)]
pub struct Digester {
    hasher: Hasher,
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self.hasher {
            Hasher::Sha256(_) => Algorithm::Sha256,
            Hasher::Sha512(_) => Algorithm::Sha512,
        };
        f.debug_struct("Digester")
            .field("algorithm", &algorithm)
            .finish()
    }
}

impl Digester {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Produce the digest of everything fed so far.
    pub fn finalize(self) -> Digest {
        let (algorithm, hex) = match self.hasher {
            Hasher::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            Hasher::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, hex }
    }
}

/// An [`AsyncWrite`] sink that hashes and counts everything written to it.
///
/// Stored bytes are streamed through a verifier to recompute their digest
/// without holding them in memory.
#[derive(Debug)]
pub struct Verifier {
    digester: Digester,
    written: u64,
}

impl Verifier {
    /// A verifier hashing with `algorithm`.
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            digester: algorithm.digester(),
            written: 0,
        }
    }

    /// Bytes seen so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// The digest and length of everything written.
    pub fn finalize(self) -> (Digest, u64) {
        (self.digester.finalize(), self.written)
    }
}

impl AsyncWrite for Verifier {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.digester.update(buf);
        this.written += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
