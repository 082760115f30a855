//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Peer public point is not on the curve (or malformed coordinates)
    #[error("invalid peer public key")]
    InvalidPeerKey,

    /// HMAC verification failed
    #[error("hmac verification failed")]
    IntegrityFailed,

    /// Certificate thumbprint did not match the nonce-pair derivation
    #[error("thumbprint verification failed")]
    ThumbprintMismatch,

    /// Ciphertext is not a whole number of cipher blocks
    #[error("ciphertext length {0} is not block-aligned")]
    MisalignedCiphertext(usize),
}
