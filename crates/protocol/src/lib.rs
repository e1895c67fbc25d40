//! Identities, signed session messages and their binary encoding.

#![deny(missing_docs)]

mod constants;
mod encoding;
mod error;
mod id;
mod keypair;
mod keyshare;
mod message;

pub use constants::*;
pub use encoding::{
    decode, decode_all, encode, encode_envelope_list,
};
pub use error::Error;
pub use id::*;
pub use keypair::*;
pub use keyshare::KeyShare;
pub use message::*;

pub use ed25519_dalek;
pub use hex;

/// Result type for the protocol library.
pub type Result<T> = std::result::Result<T, Error>;
