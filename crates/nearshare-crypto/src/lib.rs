//! # Near Share Crypto
//!
//! Cryptographic primitives for the CDP Near Share receiver.
//!
//! This crate provides:
//! - ECDH key agreement over NIST P-256
//! - The session cryptor (AES-128-CBC bulk encryption + HMAC-SHA256
//!   authentication over the framed header and ciphertext)
//! - Nonce-pair certificate thumbprints used for in-band mutual
//!   authentication
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | ECDH P-256 |
//! | Secret Derivation | SHA-256 |
//! | Bulk Cipher | AES-128-CBC (PKCS#7) |
//! | Message Authentication | HMAC-SHA256 |
//!
//! The suite is fixed by the wire protocol; none of it is negotiable beyond
//! the curve byte carried in the connect handshake.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cryptor;
pub mod ecdh;
pub mod error;
pub mod thumbprint;

pub use cryptor::Cryptor;
pub use ecdh::{KeyPair, SharedSecret};
pub use error::CryptoError;

/// Shared secret size (SHA-256 output)
pub const SHARED_SECRET_SIZE: usize = 32;

/// AES-128 key size
pub const AES_KEY_SIZE: usize = 16;

/// AES block size (also the CBC IV size)
pub const AES_BLOCK_SIZE: usize = 16;

/// HMAC-SHA256 tag size
pub const HMAC_SIZE: usize = 32;

/// P-256 affine coordinate size
pub const COORDINATE_SIZE: usize = 32;

/// Curve identifier carried in the connect handshake
pub const CURVE_P256: u8 = 0;
