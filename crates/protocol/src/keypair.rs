//! Helper functions for working with signing keys.
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey,
};
use pem::Pem;
use rand::rngs::OsRng;

use crate::{Error, Result, PEM_PRIVATE, PEM_PUBLIC};

/// Signing keypair used for session message authentication.
///
/// The same type serves long-term identity keys and the ephemeral
/// keys regenerated for each round.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create a keypair from an existing signing key.
    pub fn from_signing_key(signing: SigningKey) -> Self {
        Self { signing }
    }

    /// Verifying key for this keypair.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Byte form of the verifying key.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.signing.verifying_key().to_bytes().to_vec()
    }

    /// Sign a payload.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.signing.sign(payload).to_bytes().to_vec()
    }

    /// Byte form of the signing key.
    fn private_bytes(&self) -> Vec<u8> {
        self.signing.to_bytes().to_vec()
    }
}

/// Verify a signature over a payload.
pub fn verify(
    key: &VerifyingKey,
    payload: &[u8],
    signature: &[u8],
) -> Result<()> {
    let bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| Error::BadSignatureLength)?;
    let signature = Signature::from_bytes(&bytes);
    key.verify(payload, &signature)
        .map_err(|_| Error::BadSignature)
}

/// Parse a verifying key from its byte form.
pub fn verifying_key(bytes: &[u8]) -> Result<VerifyingKey> {
    let bytes: [u8; 32] =
        bytes.try_into().map_err(|_| Error::BadVerifyingKey)?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| Error::BadVerifyingKey)
}

/// Encode a keypair into a PEM-encoded string.
pub fn encode_keypair(keypair: &Keypair) -> String {
    let public_pem = Pem::new(PEM_PUBLIC, keypair.public_bytes());
    let private_pem = Pem::new(PEM_PRIVATE, keypair.private_bytes());
    pem::encode_many(&[public_pem, private_pem])
}

/// Decode from a PEM-encoded string into a keypair.
pub fn decode_keypair(keypair: impl AsRef<[u8]>) -> Result<Keypair> {
    let mut pems = pem::parse_many(keypair)?;
    if pems.len() == 2 {
        let (first, second) = (pems.remove(0), pems.remove(0));
        if (PEM_PUBLIC, PEM_PRIVATE) == (first.tag(), second.tag()) {
            let private: [u8; 32] = second
                .into_contents()
                .as_slice()
                .try_into()
                .map_err(|_| Error::BadKeypairPem)?;
            Ok(Keypair {
                signing: SigningKey::from_bytes(&private),
            })
        } else {
            Err(Error::BadKeypairPem)
        }
    } else {
        Err(Error::BadKeypairPem)
    }
}
