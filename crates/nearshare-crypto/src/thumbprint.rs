//! Nonce-pair certificate thumbprints.
//!
//! Neither side validates the peer certificate against a PKI. Instead each
//! side proves it observed the same connect-handshake nonces by signing its
//! certificate with an HMAC keyed on a digest of the nonce pair. The
//! initiator signs with (initiator nonce, responder nonce); the responder
//! replies with the reversed ordering.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::HMAC_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Derive the thumbprint key from an ordered nonce pair.
#[must_use]
pub fn thumbprint_key(first_nonce: u64, second_nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(first_nonce.to_le_bytes());
    hasher.update(second_nonce.to_le_bytes());

    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Sign certificate bytes with a thumbprint key.
#[must_use]
pub fn sign_certificate(key: &[u8; 32], certificate: &[u8]) -> [u8; HMAC_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(certificate);

    let mut out = [0u8; HMAC_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Verify a received thumbprint in constant time.
///
/// # Errors
///
/// Returns `CryptoError::ThumbprintMismatch` if the proof does not match.
pub fn verify_certificate(
    key: &[u8; 32],
    certificate: &[u8],
    thumbprint: &[u8],
) -> Result<(), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(certificate);
    mac.verify_slice(thumbprint)
        .map_err(|_| CryptoError::ThumbprintMismatch)
}
