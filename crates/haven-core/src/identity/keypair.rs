//! Hybrid signing keys: Ed25519 plus ML-DSA (Dilithium).
//!
//! Signing material is completely separate from the key-agreement material
//! in [`crate::identity::IdentityKeys`]; neither half is ever used for the
//! other purpose. Verification returns `bool` and never errors: callers
//! gate trust on the boolean while the distinguished failure cause goes to
//! the debug log.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{PublicKey as _, SecretKey as _};
use tracing::debug;

use crate::error::{HavenError, HavenResult};
use crate::identity::signature::MessageSignature;

/// Private signing keypair (Ed25519 + ML-DSA).
pub struct SigningKeypair {
    ed25519: SigningKey,
    ml_dsa_secret: dilithium5::SecretKey,
    ml_dsa_public: dilithium5::PublicKey,
}

impl SigningKeypair {
    /// Generate a fresh hybrid signing keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
        let ed25519 = SigningKey::from_bytes(&seed);

        let (ml_dsa_public, ml_dsa_secret) = dilithium5::keypair();

        Self {
            ed25519,
            ml_dsa_secret,
            ml_dsa_public,
        }
    }

    /// Sign a message with both components.
    pub fn sign(&self, message: &[u8]) -> MessageSignature {
        let ed25519_sig = self.ed25519.sign(message);
        let ml_dsa_sig = dilithium5::sign(message, &self.ml_dsa_secret);
        MessageSignature::new(ed25519_sig, ml_dsa_sig)
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> SigningPublicKey {
        SigningPublicKey {
            ed25519: self.ed25519.verifying_key(),
            ml_dsa: self.ml_dsa_public.clone(),
        }
    }

    /// Serialize as `[seed: 32][len: 4 LE][ml_dsa_secret][len: 4 LE][ml_dsa_public]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let secret_bytes = self.ml_dsa_secret.as_bytes();
        let public_bytes = self.ml_dsa_public.as_bytes();

        let mut bytes =
            Vec::with_capacity(32 + 4 + secret_bytes.len() + 4 + public_bytes.len());
        bytes.extend_from_slice(&self.ed25519.to_bytes());
        bytes.extend_from_slice(&(secret_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(secret_bytes);
        bytes.extend_from_slice(&(public_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(public_bytes);
        bytes
    }

    /// Deserialize from the format produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::Identity`] on truncated or malformed input.
    pub fn from_bytes(bytes: &[u8]) -> HavenResult<Self> {
        if bytes.len() < 36 {
            return Err(HavenError::Identity(
                "Keypair data too short".to_string(),
            ));
        }

        let seed: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| HavenError::Identity("Invalid ed25519 seed".to_string()))?;
        let ed25519 = SigningKey::from_bytes(&seed);

        let mut offset = 32;

        let secret_len = read_len(bytes, offset)?;
        offset += 4;
        if bytes.len() < offset + secret_len {
            return Err(HavenError::Identity("Keypair data truncated".to_string()));
        }
        let ml_dsa_secret = dilithium5::SecretKey::from_bytes(&bytes[offset..offset + secret_len])
            .map_err(|e| HavenError::Identity(format!("Invalid ML-DSA secret key: {}", e)))?;
        offset += secret_len;

        let public_len = read_len(bytes, offset)?;
        offset += 4;
        if bytes.len() < offset + public_len {
            return Err(HavenError::Identity("Keypair data truncated".to_string()));
        }
        let ml_dsa_public = dilithium5::PublicKey::from_bytes(&bytes[offset..offset + public_len])
            .map_err(|e| HavenError::Identity(format!("Invalid ML-DSA public key: {}", e)))?;

        Ok(Self {
            ed25519,
            ml_dsa_secret,
            ml_dsa_public,
        })
    }
}

impl Clone for SigningKeypair {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.to_bytes()).expect("serialized keypair always round-trips")
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("ed25519_public", &hex::encode(self.ed25519.verifying_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Public half of a hybrid signing keypair.
#[derive(Clone)]
pub struct SigningPublicKey {
    ed25519: VerifyingKey,
    ml_dsa: dilithium5::PublicKey,
}

impl SigningPublicKey {
    /// Verify a detached signature over `message`.
    ///
    /// Both the Ed25519 and ML-DSA components must verify. Returns `false`
    /// on any failure; the cause is logged at debug level but never
    /// surfaced as an error.
    pub fn verify(&self, message: &[u8], signature: &MessageSignature) -> bool {
        if self.ed25519.verify(message, signature.ed25519()).is_err() {
            debug!("Signature rejected: ed25519 component failed verification");
            return false;
        }

        match dilithium5::open(signature.ml_dsa(), &self.ml_dsa) {
            Ok(recovered) if recovered == message => true,
            Ok(_) => {
                debug!("Signature rejected: ML-DSA component signed a different payload");
                false
            }
            Err(e) => {
                debug!("Signature rejected: ML-DSA component failed verification: {}", e);
                false
            }
        }
    }

    /// Raw Ed25519 public key bytes.
    pub fn ed25519_bytes(&self) -> &[u8] {
        self.ed25519.as_bytes()
    }

    /// Raw ML-DSA public key bytes.
    pub fn ml_dsa_bytes(&self) -> &[u8] {
        self.ml_dsa.as_bytes()
    }

    /// Serialize as `[ed25519: 32][len: 4 LE][ml_dsa]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ml_dsa_bytes = self.ml_dsa.as_bytes();

        let mut bytes = Vec::with_capacity(32 + 4 + ml_dsa_bytes.len());
        bytes.extend_from_slice(self.ed25519.as_bytes());
        bytes.extend_from_slice(&(ml_dsa_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(ml_dsa_bytes);
        bytes
    }

    /// Deserialize from the format produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::Identity`] on truncated or malformed input.
    pub fn from_bytes(bytes: &[u8]) -> HavenResult<Self> {
        if bytes.len() < 36 {
            return Err(HavenError::Identity(
                "Public key data too short".to_string(),
            ));
        }

        let ed25519_bytes: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| HavenError::Identity("Invalid ed25519 public key".to_string()))?;
        let ed25519 = VerifyingKey::from_bytes(&ed25519_bytes)
            .map_err(|e| HavenError::Identity(format!("Invalid ed25519 public key: {}", e)))?;

        let ml_dsa_len = read_len(bytes, 32)?;
        if bytes.len() < 36 + ml_dsa_len {
            return Err(HavenError::Identity(
                "Public key data truncated".to_string(),
            ));
        }
        let ml_dsa = dilithium5::PublicKey::from_bytes(&bytes[36..36 + ml_dsa_len])
            .map_err(|e| HavenError::Identity(format!("Invalid ML-DSA public key: {}", e)))?;

        Ok(Self { ed25519, ml_dsa })
    }
}

impl PartialEq for SigningPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for SigningPublicKey {}

impl std::hash::Hash for SigningPublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl std::fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningPublicKey")
            .field("ed25519", &hex::encode(self.ed25519.as_bytes()))
            .field("ml_dsa_len", &self.ml_dsa.as_bytes().len())
            .finish()
    }
}

impl serde::Serialize for SigningPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for SigningPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

fn read_len(bytes: &[u8], offset: usize) -> HavenResult<usize> {
    let len_bytes: [u8; 4] = bytes
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| HavenError::Identity("Length prefix truncated".to_string()))?;
    Ok(u32::from_le_bytes(len_bytes) as usize)
}
