use thiserror::Error;

/// Errors generated by the protocol library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error generated when a message tag is unknown.
    #[error("unknown message kind {0}")]
    MessageKind(u8),

    /// Error generated when an identifier has the wrong width.
    #[error("identifier must be 20 bytes")]
    BadIdLength,

    /// Error generated when a verifying key is malformed.
    #[error("malformed verifying key")]
    BadVerifyingKey,

    /// Error generated when a signature has the wrong width.
    #[error("malformed signature")]
    BadSignatureLength,

    /// Error generated when a signature fails verification.
    #[error("signature verification failed")]
    BadSignature,

    /// Error generated when a key share entry is missing.
    #[error(r#"no key share entry for "{0}""#)]
    MissingKeyShare(String),

    /// Error generated decoding a keypair PEM with the wrong
    /// structure.
    #[error("invalid keypair PEM")]
    BadKeypairPem,

    /// Error generated when a buffer does not contain a whole
    /// message record.
    #[error("truncated message record")]
    TruncatedRecord,

    /// Error generated parsing hexadecimal identifiers.
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    /// Error generated by the PEM library.
    #[error(transparent)]
    Pem(#[from] pem::PemError),

    /// Error generated during binary encoding and decoding.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
