//! Session cryptor: AES-128-CBC bulk encryption with HMAC-SHA256
//! authentication over the framed header and ciphertext.
//!
//! The key schedule splits the 32-byte session secret: the first half keys
//! the block cipher, the second half keys per-message IV derivation, and the
//! whole secret keys the HMAC. The IV is derived from the session id and the
//! message sequence number, so both directions compute it from header fields
//! alone and no IV travels on the wire.

use hmac::{Hmac, Mac};
use libaes::Cipher;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ecdh::SharedSecret;
use crate::error::CryptoError;
use crate::{AES_BLOCK_SIZE, AES_KEY_SIZE, HMAC_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Session-scoped encryption and authentication state.
///
/// The cryptor holds keys only; sequence counters live with the session, and
/// every operation takes the header fields it needs explicitly.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Cryptor {
    aes_key: [u8; AES_KEY_SIZE],
    iv_key: [u8; AES_KEY_SIZE],
    hmac_key: [u8; 32],
}

impl Cryptor {
    /// Build the cryptor from a derived session secret.
    #[must_use]
    pub fn new(secret: &SharedSecret) -> Self {
        let bytes = secret.as_bytes();
        let mut aes_key = [0u8; AES_KEY_SIZE];
        let mut iv_key = [0u8; AES_KEY_SIZE];
        aes_key.copy_from_slice(&bytes[..AES_KEY_SIZE]);
        iv_key.copy_from_slice(&bytes[AES_KEY_SIZE..]);

        Self {
            aes_key,
            iv_key,
            hmac_key: *bytes,
        }
    }

    /// Derive the per-message IV from the session id and sequence number.
    fn derive_iv(&self, session_id: u64, sequence: u32) -> [u8; AES_BLOCK_SIZE] {
        let mut mac =
            HmacSha256::new_from_slice(&self.iv_key).expect("hmac accepts any key length");
        mac.update(&session_id.to_le_bytes());
        mac.update(&sequence.to_le_bytes());
        let tag = mac.finalize().into_bytes();

        let mut iv = [0u8; AES_BLOCK_SIZE];
        iv.copy_from_slice(&tag[..AES_BLOCK_SIZE]);
        iv
    }

    /// Encrypt a message body. Output length is padded to a whole number of
    /// cipher blocks (PKCS#7).
    #[must_use]
    pub fn encrypt(&self, session_id: u64, sequence: u32, plaintext: &[u8]) -> Vec<u8> {
        let iv = self.derive_iv(session_id, sequence);
        Cipher::new_128(&self.aes_key).cbc_encrypt(&iv, plaintext)
    }

    /// Decrypt a message body.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MisalignedCiphertext` if the input is not
    /// block-aligned. Callers verify the HMAC before decrypting, so padding
    /// is well-formed whenever this is reached.
    pub fn decrypt(
        &self,
        session_id: u64,
        sequence: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::MisalignedCiphertext(ciphertext.len()));
        }

        let iv = self.derive_iv(session_id, sequence);
        Ok(Cipher::new_128(&self.aes_key).cbc_decrypt(&iv, ciphertext))
    }

    /// HMAC-SHA256 tag over the serialized header and ciphertext.
    #[must_use]
    pub fn sign(&self, header: &[u8], ciphertext: &[u8]) -> [u8; HMAC_SIZE] {
        let mut mac =
            HmacSha256::new_from_slice(&self.hmac_key).expect("hmac accepts any key length");
        mac.update(header);
        mac.update(ciphertext);

        let mut out = [0u8; HMAC_SIZE];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    /// Verify the received tag in constant time.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::IntegrityFailed` on any mismatch.
    pub fn verify(&self, header: &[u8], ciphertext: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.hmac_key).expect("hmac accepts any key length");
        mac.update(header);
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| CryptoError::IntegrityFailed)
    }
}
