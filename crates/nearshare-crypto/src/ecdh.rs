//! ECDH key agreement over NIST P-256.
//!
//! Each session owns an ephemeral P-256 keypair. The connect handshake
//! carries the affine coordinates of both public points; the session secret
//! is the SHA-256 digest of the raw ECDH output.

use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::COORDINATE_SIZE;

/// Ephemeral P-256 keypair for one session.
pub struct KeyPair {
    secret: SecretKey,
}

/// Derived session secret (SHA-256 of the raw ECDH output).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a new ephemeral keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            secret: SecretKey::random(rng),
        }
    }

    /// Affine x coordinate of the public point.
    #[must_use]
    pub fn public_x(&self) -> [u8; COORDINATE_SIZE] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; COORDINATE_SIZE];
        out.copy_from_slice(point.x().expect("uncompressed point has x"));
        out
    }

    /// Affine y coordinate of the public point.
    #[must_use]
    pub fn public_y(&self) -> [u8; COORDINATE_SIZE] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; COORDINATE_SIZE];
        out.copy_from_slice(point.y().expect("uncompressed point has y"));
        out
    }

    /// Perform the key agreement against the peer's public coordinates.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPeerKey` if the coordinates are not
    /// 32 bytes each or do not describe a point on the curve.
    pub fn exchange(&self, peer_x: &[u8], peer_y: &[u8]) -> Result<SharedSecret, CryptoError> {
        if peer_x.len() != COORDINATE_SIZE || peer_y.len() != COORDINATE_SIZE {
            return Err(CryptoError::InvalidPeerKey);
        }

        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(peer_x),
            FieldBytes::from_slice(peer_y),
            false,
        );
        let peer: PublicKey =
            Option::from(PublicKey::from_encoded_point(&point)).ok_or(CryptoError::InvalidPeerKey)?;

        let raw = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let digest = Sha256::digest(raw.raw_secret_bytes());

        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(SharedSecret(out))
    }
}

impl SharedSecret {
    /// Raw secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Build a secret from raw bytes (test vectors, key import).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_exchange_agrees() {
        let alice = KeyPair::generate(&mut OsRng);
        let bob = KeyPair::generate(&mut OsRng);

        let ab = alice.exchange(&bob.public_x(), &bob.public_y()).unwrap();
        let ba = bob.exchange(&alice.public_x(), &alice.public_y()).unwrap();

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_public_coordinates_are_stable() {
        let pair = KeyPair::generate(&mut OsRng);
        assert_eq!(pair.public_x(), pair.public_x());
        assert_eq!(pair.public_y(), pair.public_y());
    }

    #[test]
    fn test_exchange_rejects_bad_lengths() {
        let pair = KeyPair::generate(&mut OsRng);
        assert_eq!(
            pair.exchange(&[0u8; 31], &[0u8; 32]),
            Err(CryptoError::InvalidPeerKey)
        );
        assert_eq!(
            pair.exchange(&[0u8; 32], &[]),
            Err(CryptoError::InvalidPeerKey)
        );
    }

    #[test]
    fn test_exchange_rejects_off_curve_point() {
        let pair = KeyPair::generate(&mut OsRng);
        // (1, 1) is not on P-256
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x[31] = 1;
        y[31] = 1;
        assert_eq!(pair.exchange(&x, &y), Err(CryptoError::InvalidPeerKey));
    }

    #[test]
    fn test_different_pairs_different_secrets() {
        let alice = KeyPair::generate(&mut OsRng);
        let bob = KeyPair::generate(&mut OsRng);
        let carol = KeyPair::generate(&mut OsRng);

        let ab = alice.exchange(&bob.public_x(), &bob.public_y()).unwrap();
        let ac = alice.exchange(&carol.public_x(), &carol.public_y()).unwrap();

        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }
}
