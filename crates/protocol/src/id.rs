//! Peer identifiers and fixed-width digests.
use rand::{CryptoRng, RngCore};
use sha2::{Digest as _, Sha256};
use std::{fmt, str::FromStr};

use crate::{Error, Result, DIGEST_LEN};

/// Fixed-width digest used for round identifiers and roster hashes.
pub type Digest = [u8; DIGEST_LEN];

/// Compute the fixed-width digest of a byte buffer.
///
/// SHA-256 truncated to the digest width.
pub fn digest(data: impl AsRef<[u8]>) -> Digest {
    let hash = Sha256::digest(data.as_ref());
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hash[..DIGEST_LEN]);
    out
}

/// Opaque identifier for a participant in the group.
///
/// The canonical ordering of participants is the byte order
/// of their identifiers.
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord,
)]
pub struct PeerId([u8; DIGEST_LEN]);

impl PeerId {
    /// Create a peer id from raw bytes.
    pub fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a peer id from the byte form of a public key.
    pub fn from_public_key(key: impl AsRef<[u8]>) -> Self {
        Self(digest(key))
    }

    /// Generate a random peer id.
    pub fn random(rng: &mut (impl CryptoRng + RngCore)) -> Self {
        let mut bytes = [0u8; DIGEST_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; DIGEST_LEN] =
            value.try_into().map_err(|_| Error::BadIdLength)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        bytes.as_slice().try_into()
    }
}

/// Identifier of a single protocol round.
///
/// Derived deterministically from the Enlist set of the round's
/// bootstrap so that every server computes the same value.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct RoundId(Digest);

impl RoundId {
    /// Round id whose bytes are all zero.
    ///
    /// Never the outcome of a derivation; used by queue requests
    /// to mark that the sender does not yet know the round.
    pub const ZERO: RoundId = RoundId([0u8; DIGEST_LEN]);

    /// Create a round id from a digest.
    pub fn new(digest: Digest) -> Self {
        Self(digest)
    }

    /// Whether this is the zero round id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LEN]
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for RoundId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Digest> for RoundId {
    fn from(value: Digest) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for RoundId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; DIGEST_LEN] =
            value.try_into().map_err(|_| Error::BadIdLength)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
