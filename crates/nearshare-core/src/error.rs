//! Error types for the protocol engine.
//!
//! Every error surfaced on a connection's reader is fatal to the session:
//! the session is disposed and the transport closed. The protocol has no
//! resync primitive, so there is no per-message recovery.

use std::borrow::Cow;
use thiserror::Error;

use crate::wire::WireError;
use nearshare_crypto::CryptoError;

/// Errors raised by the session engine and applications
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed frame, header, or property bag
    #[error("parse error: {0}")]
    Parse(#[from] WireError),

    /// HMAC mismatch on an encrypted message
    #[error("message integrity check failed")]
    Integrity,

    /// Certificate thumbprint did not match the nonce-pair derivation
    #[error("device authentication failed")]
    Auth,

    /// Frame addressed a local session id with no registration
    #[error("unknown session {0:#x}")]
    UnknownSession(u32),

    /// Frame's remote half does not match the registered session
    #[error("session remote id mismatch: expected {expected:#x}, got {actual:#x}")]
    WrongRemote {
        /// Remote id recorded at session creation
        expected: u32,
        /// Remote id carried by the frame
        actual: u32,
    },

    /// Frame arrived from a different device than the session was bound to
    #[error("session device mismatch")]
    WrongDevice,

    /// Session has already been disposed
    #[error("session disposed")]
    Disposed,

    /// Message is invalid for the current state, or a value is out of range
    #[error("protocol violation: {0}")]
    Violation(Cow<'static, str>),

    /// Request names a capability this receiver does not implement
    #[error("not implemented: {0}")]
    NotImplemented(Cow<'static, str>),

    /// Transfer was cancelled by the platform handler or the peer
    #[error("transfer cancelled")]
    Cancelled,

    /// Cryptographic failure below the envelope layer
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Transport I/O failure
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Protocol violation with static context
    #[must_use]
    pub const fn violation(context: &'static str) -> Self {
        ProtocolError::Violation(Cow::Borrowed(context))
    }

    /// Unimplemented capability with static context
    #[must_use]
    pub const fn not_implemented(context: &'static str) -> Self {
        ProtocolError::NotImplemented(Cow::Borrowed(context))
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::IntegrityFailed => ProtocolError::Integrity,
            CryptoError::ThumbprintMismatch => ProtocolError::Auth,
            other => ProtocolError::Crypto(other),
        }
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_maps_from_crypto() {
        let err: ProtocolError = CryptoError::IntegrityFailed.into();
        assert!(matches!(err, ProtocolError::Integrity));
    }

    #[test]
    fn test_thumbprint_maps_to_auth() {
        let err: ProtocolError = CryptoError::ThumbprintMismatch.into();
        assert!(matches!(err, ProtocolError::Auth));
    }

    #[test]
    fn test_other_crypto_errors_pass_through() {
        let err: ProtocolError = CryptoError::InvalidPeerKey.into();
        assert!(matches!(err, ProtocolError::Crypto(_)));
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::UnknownSession(0x0e);
        assert!(err.to_string().contains("0xe"));

        let err = ProtocolError::violation("blob out of range");
        assert!(err.to_string().contains("blob out of range"));
    }
}
