//! Hybrid envelope encryption for message payloads.
//!
//! Each payload is encrypted exactly once under a fresh content key and
//! nonce; the content key is then wrapped for every intended recipient.
//! Asymmetric cost is one fixed-size [`WrappedKey`] per recipient, no
//! matter how large the payload.
//!
//! ## Key wrap
//!
//! A [`WrappedKey`] protects the content key twice:
//! - X25519: ephemeral Diffie-Hellman against the recipient's static key
//! - ML-KEM (Kyber768): an encapsulated shared secret
//!
//! Both derived keys encrypt the same content key, and unwrapping requires
//! both copies to decrypt and agree. An attacker must break both schemes.
//!
//! ## Wire shape
//!
//! [`Envelope`] keeps the nonce and the 16-byte AEAD tag as separate
//! fields next to the ciphertext, so the whole structure is
//! `{ ciphertext, wrapped_keys, nonce, auth_tag }` on the wire.

use hkdf::Hkdf;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, SharedSecret as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::{ContentCrypto, NONCE_SIZE, TAG_SIZE};
use crate::error::{HavenError, HavenResult};
use crate::identity::{IdentityKeys, MessageSignature, PublicKeys, SigningPublicKey, UserId};

/// Domain separation string for key derivation.
const HKDF_INFO: &[u8] = b"haven-key-wrap-v1";

/// A content key wrapped for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Who can unwrap this entry.
    pub recipient: UserId,
    /// Ephemeral X25519 public key for the Diffie-Hellman half.
    pub x25519_ephemeral_pk: [u8; 32],
    /// Content key encrypted under the X25519-derived key.
    pub x25519_wrapped: Vec<u8>,
    /// ML-KEM encapsulation ciphertext.
    pub mlkem_ciphertext: Vec<u8>,
    /// Content key encrypted under the ML-KEM-derived key.
    pub mlkem_wrapped: Vec<u8>,
}

impl WrappedKey {
    /// Wrap a content key for a recipient's public bundle.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::EncryptionFailure`] if randomness or either
    /// encryption half fails.
    pub fn seal_for(content_key: &[u8; 32], recipient: &PublicKeys) -> HavenResult<Self> {
        // X25519 half: fresh ephemeral key per wrap.
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| HavenError::EncryptionFailure(format!("Randomness failed: {}", e)))?;
        let ephemeral = StaticSecret::from(seed);
        let ephemeral_pk = X25519PublicKey::from(&ephemeral);

        let x25519_shared = ephemeral.diffie_hellman(recipient.x25519());
        let x25519_key = derive_key(x25519_shared.as_bytes(), b"x25519");
        let x25519_wrapped = ContentCrypto::new(&x25519_key).encrypt(content_key)?;

        // ML-KEM half: encapsulate against the recipient's Kyber key.
        let (mlkem_shared, mlkem_ct) = kyber768::encapsulate(recipient.mlkem());
        let mlkem_key = derive_key(mlkem_shared.as_bytes(), b"mlkem");
        let mlkem_wrapped = ContentCrypto::new(&mlkem_key).encrypt(content_key)?;

        Ok(Self {
            recipient: recipient.user_id(),
            x25519_ephemeral_pk: *ephemeral_pk.as_bytes(),
            x25519_wrapped,
            mlkem_ciphertext: mlkem_ct.as_bytes().to_vec(),
            mlkem_wrapped,
        })
    }

    /// Unwrap the content key with the recipient's private material.
    ///
    /// Both halves must decrypt to the same 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::DecryptionFailure`] if this entry is for a
    /// different identity, either half fails to decrypt, or the halves
    /// disagree.
    pub fn unwrap_for(&self, keys: &IdentityKeys) -> HavenResult<[u8; 32]> {
        if keys.user_id() != self.recipient {
            return Err(HavenError::DecryptionFailure(
                "Wrapped key is addressed to a different identity".to_string(),
            ));
        }

        let ephemeral_pk = X25519PublicKey::from(self.x25519_ephemeral_pk);
        let x25519_shared = keys.x25519_secret().diffie_hellman(&ephemeral_pk);
        let x25519_key = derive_key(x25519_shared.as_bytes(), b"x25519");
        let x25519_plain = ContentCrypto::new(&x25519_key).decrypt(&self.x25519_wrapped)?;
        let x25519_content: [u8; 32] = x25519_plain.as_slice().try_into().map_err(|_| {
            HavenError::DecryptionFailure("X25519 half yielded a malformed key".to_string())
        })?;

        let mlkem_ct = kyber768::Ciphertext::from_bytes(&self.mlkem_ciphertext).map_err(|e| {
            HavenError::DecryptionFailure(format!("Malformed ML-KEM ciphertext: {}", e))
        })?;
        let mlkem_shared = kyber768::decapsulate(&mlkem_ct, keys.mlkem_secret());
        let mlkem_key = derive_key(mlkem_shared.as_bytes(), b"mlkem");
        let mlkem_plain = ContentCrypto::new(&mlkem_key).decrypt(&self.mlkem_wrapped)?;
        let mlkem_content: [u8; 32] = mlkem_plain.as_slice().try_into().map_err(|_| {
            HavenError::DecryptionFailure("ML-KEM half yielded a malformed key".to_string())
        })?;

        if x25519_content != mlkem_content {
            return Err(HavenError::DecryptionFailure(
                "Key halves disagree; wrapped key was tampered with".to_string(),
            ));
        }

        Ok(x25519_content)
    }
}

/// Derive a wrap key from a shared secret with domain separation.
fn derive_key(shared_secret: &[u8], context: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let info = [HKDF_INFO, context].concat();

    let mut key = [0u8; 32];
    hk.expand(&info, &mut key)
        .expect("HKDF expand never fails for 32-byte output");
    key
}

/// The wire form of one encrypted message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// AEAD ciphertext, tag excluded.
    pub ciphertext: Vec<u8>,
    /// The content key wrapped once per recipient.
    pub wrapped_keys: Vec<WrappedKey>,
    /// AEAD nonce, fresh per message.
    pub nonce: [u8; NONCE_SIZE],
    /// Poly1305 authentication tag over the ciphertext.
    pub auth_tag: [u8; TAG_SIZE],
}

impl Envelope {
    /// Encrypt a payload for a set of recipients.
    ///
    /// A fresh content key and nonce are generated per call; sealing the
    /// same plaintext twice never produces the same envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::EncryptionFailure`] if `recipients` is empty
    /// or any wrap fails.
    pub fn seal(plaintext: &[u8], recipients: &[PublicKeys]) -> HavenResult<Self> {
        if recipients.is_empty() {
            return Err(HavenError::EncryptionFailure(
                "Cannot seal for zero recipients".to_string(),
            ));
        }

        let content_key = ContentCrypto::generate_key();
        let nonce = ContentCrypto::generate_nonce();

        let (ciphertext, auth_tag) =
            ContentCrypto::new(&content_key).encrypt_detached(plaintext, &nonce)?;

        let wrapped_keys = recipients
            .iter()
            .map(|recipient| WrappedKey::seal_for(&content_key, recipient))
            .collect::<HavenResult<Vec<_>>>()?;

        Ok(Self {
            ciphertext,
            wrapped_keys,
            nonce,
            auth_tag,
        })
    }

    /// Decrypt the payload with one recipient's private material.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::DecryptionFailure`] if no wrapped key matches
    /// this identity, the key fails to unwrap, or the AEAD tag does not
    /// verify. No partial plaintext escapes on failure.
    pub fn open(&self, keys: &IdentityKeys) -> HavenResult<Vec<u8>> {
        let user_id = keys.user_id();
        let wrapped = self
            .wrapped_keys
            .iter()
            .find(|wk| wk.recipient == user_id)
            .ok_or_else(|| {
                HavenError::DecryptionFailure(
                    "No wrapped key for this identity".to_string(),
                )
            })?;

        let content_key = wrapped.unwrap_for(keys)?;
        ContentCrypto::new(&content_key).decrypt_detached(
            &self.ciphertext,
            &self.auth_tag,
            &self.nonce,
        )
    }

    /// Whether a given identity has a wrapped key in this envelope.
    pub fn is_addressed_to(&self, user: &UserId) -> bool {
        self.wrapped_keys.iter().any(|wk| &wk.recipient == user)
    }

    /// All recipients of this envelope.
    pub fn recipients(&self) -> Vec<&UserId> {
        self.wrapped_keys.iter().map(|wk| &wk.recipient).collect()
    }
}

/// An encrypted payload together with its detached signature.
///
/// The signature covers the plaintext, so verification is only possible
/// after a successful decrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBody {
    pub envelope: Envelope,
    pub signature: MessageSignature,
}

impl SealedBody {
    /// Sign the plaintext and seal it for the recipients.
    pub fn seal(
        plaintext: &[u8],
        recipients: &[PublicKeys],
        signer: &IdentityKeys,
    ) -> HavenResult<Self> {
        let signature = signer.sign(plaintext);
        let envelope = Envelope::seal(plaintext, recipients)?;
        Ok(Self {
            envelope,
            signature,
        })
    }

    /// Decrypt and verify against the claimed sender's signing key.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::DecryptionFailure`] if decryption fails and
    /// [`HavenError::SignatureInvalid`] if the payload decrypts but the
    /// signature does not verify.
    pub fn open(
        &self,
        keys: &IdentityKeys,
        sender: &SigningPublicKey,
    ) -> HavenResult<Vec<u8>> {
        let plaintext = self.envelope.open(keys)?;

        if !sender.verify(&plaintext, &self.signature) {
            return Err(HavenError::SignatureInvalid(
                "Hybrid signature rejected for decrypted payload".to_string(),
            ));
        }

        Ok(plaintext)
    }
}
