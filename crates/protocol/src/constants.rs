//! Constants used by the session protocol.

/// Width in bytes of peer identifiers, round identifiers and
/// digests.
pub const DIGEST_LEN: usize = 20;

/// Width in bytes of the nonces carried by Init messages and
/// queue requests.
pub const NONCE_LEN: usize = 16;

/// Overlay topic for session state machine messages.
pub const SESSION_TOPIC: &str = "session";

/// Overlay topic for round packets.
pub const ROUND_TOPIC: &str = "round";

/// Tag for PEM encoding of the signing private key.
pub const PEM_PRIVATE: &str = "VEIL SIGNING PRIVATE KEY";

/// Tag for PEM encoding of the signing public key.
pub const PEM_PUBLIC: &str = "VEIL SIGNING PUBLIC KEY";
