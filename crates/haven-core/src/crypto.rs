//! Symmetric content encryption for message payloads.
//!
//! Every message is encrypted under a fresh 32-byte content key with
//! ChaCha20-Poly1305 and a fresh 12-byte nonce. The content key itself is
//! wrapped for recipients by the envelope layer; this module only deals in
//! raw AEAD operations.
//!
//! Two forms are provided:
//! - combined: nonce prepended to `ciphertext || tag`, used for key-wrap
//!   blobs where the whole thing travels as one opaque field
//! - detached: nonce and 16-byte auth tag kept as separate fields, used
//!   for the message envelope wire form

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::error::{HavenError, HavenResult};

/// Size of the ChaCha20-Poly1305 nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// AEAD cipher bound to one 32-byte content key.
pub struct ContentCrypto {
    cipher: ChaCha20Poly1305,
}

impl ContentCrypto {
    /// Create a cipher from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a fresh random 32-byte content key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a fresh random nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt with a fresh nonce, returning `nonce || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::EncryptionFailure`] if the AEAD operation
    /// fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> HavenResult<Vec<u8>> {
        let nonce_bytes = Self::generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| HavenError::EncryptionFailure(format!("AEAD encrypt: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::DecryptionFailure`] if the data is too short
    /// to contain a nonce or the tag does not verify. No partial plaintext
    /// escapes on failure.
    pub fn decrypt(&self, data: &[u8]) -> HavenResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(HavenError::DecryptionFailure(
                "Data too short to contain nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| HavenError::DecryptionFailure("AEAD tag verification failed".to_string()))
    }

    /// Encrypt under an explicit nonce, returning the ciphertext and the
    /// authentication tag as separate values.
    pub fn encrypt_detached(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> HavenResult<(Vec<u8>, [u8; TAG_SIZE])> {
        let mut combined = self
            .cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| HavenError::EncryptionFailure(format!("AEAD encrypt: {}", e)))?;

        // The aead crate appends the tag to the ciphertext.
        let tag_start = combined.len() - TAG_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&combined[tag_start..]);
        combined.truncate(tag_start);

        Ok((combined, tag))
    }

    /// Decrypt a detached `(ciphertext, tag)` pair under an explicit nonce.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::DecryptionFailure`] on any tag mismatch,
    /// including single-bit corruption of ciphertext or tag.
    pub fn decrypt_detached(
        &self,
        ciphertext: &[u8],
        tag: &[u8; TAG_SIZE],
        nonce: &[u8; NONCE_SIZE],
    ) -> HavenResult<Vec<u8>> {
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), combined.as_slice())
            .map_err(|_| HavenError::DecryptionFailure("AEAD tag verification failed".to_string()))
    }
}

/// Blake3 hash of arbitrary content, for integrity references and
/// snapshot diagnostics.
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        key[0] = 0x42;
        key[31] = 0x24;
        key
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let crypto = ContentCrypto::new(&test_key());
        let plaintext = b"Hello Bob!";

        let encrypted = crypto.encrypt(plaintext).unwrap();
        let decrypted = crypto.decrypt(&encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_empty_payload() {
        let crypto = ContentCrypto::new(&test_key());
        let encrypted = crypto.encrypt(b"").unwrap();
        // Nonce plus tag even for empty plaintext.
        assert_eq!(encrypted.len(), NONCE_SIZE + TAG_SIZE);
        assert_eq!(crypto.decrypt(&encrypted).unwrap(), b"");
    }

    #[test]
    fn test_encrypt_large_payload() {
        let crypto = ContentCrypto::new(&test_key());
        let plaintext = vec![0xABu8; 1024 * 1024];

        let encrypted = crypto.encrypt(&plaintext).unwrap();
        let decrypted = crypto.decrypt(&encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let crypto = ContentCrypto::new(&test_key());
        let a = crypto.encrypt(b"repeated").unwrap();
        let b = crypto.encrypt(b"repeated").unwrap();
        // Fresh nonce per call.
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let crypto = ContentCrypto::new(&test_key());
        let encrypted = crypto.encrypt(b"secret").unwrap();

        let mut other_key = test_key();
        other_key[0] ^= 0xFF;
        let other = ContentCrypto::new(&other_key);

        assert!(matches!(
            other.decrypt(&encrypted),
            Err(HavenError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let crypto = ContentCrypto::new(&test_key());
        let mut encrypted = crypto.encrypt(b"integrity matters").unwrap();

        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;

        assert!(crypto.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_truncated_data_fails() {
        let crypto = ContentCrypto::new(&test_key());
        assert!(crypto.decrypt(&[0u8; 4]).is_err());
        assert!(crypto.decrypt(&[]).is_err());
    }

    #[test]
    fn test_detached_roundtrip() {
        let crypto = ContentCrypto::new(&test_key());
        let nonce = ContentCrypto::generate_nonce();

        let (ciphertext, tag) = crypto.encrypt_detached(b"detached form", &nonce).unwrap();
        assert_eq!(ciphertext.len(), b"detached form".len());

        let decrypted = crypto.decrypt_detached(&ciphertext, &tag, &nonce).unwrap();
        assert_eq!(decrypted, b"detached form");
    }

    #[test]
    fn test_detached_tampered_tag_fails() {
        let crypto = ContentCrypto::new(&test_key());
        let nonce = ContentCrypto::generate_nonce();
        let (ciphertext, mut tag) = crypto.encrypt_detached(b"payload", &nonce).unwrap();

        tag[0] ^= 0x01;

        assert!(matches!(
            crypto.decrypt_detached(&ciphertext, &tag, &nonce),
            Err(HavenError::DecryptionFailure(_))
        ));
    }

    #[test]
    fn test_detached_tampered_ciphertext_fails() {
        let crypto = ContentCrypto::new(&test_key());
        let nonce = ContentCrypto::generate_nonce();
        let (mut ciphertext, tag) = crypto.encrypt_detached(b"payload", &nonce).unwrap();

        ciphertext[0] ^= 0x80;

        assert!(crypto.decrypt_detached(&ciphertext, &tag, &nonce).is_err());
    }

    #[test]
    fn test_detached_wrong_nonce_fails() {
        let crypto = ContentCrypto::new(&test_key());
        let nonce = ContentCrypto::generate_nonce();
        let (ciphertext, tag) = crypto.encrypt_detached(b"payload", &nonce).unwrap();

        let mut other_nonce = nonce;
        other_nonce[0] ^= 0x01;

        assert!(crypto
            .decrypt_detached(&ciphertext, &tag, &other_nonce)
            .is_err());
    }

    #[test]
    fn test_generated_keys_and_nonces_differ() {
        assert_ne!(ContentCrypto::generate_key(), ContentCrypto::generate_key());
        assert_ne!(
            ContentCrypto::generate_nonce(),
            ContentCrypto::generate_nonce()
        );
    }

    #[test]
    fn test_content_hash_deterministic() {
        let a = content_hash(b"same input");
        let b = content_hash(b"same input");
        assert_eq!(a, b);

        let c = content_hash(b"different input");
        assert_ne!(a, c);
    }
}
