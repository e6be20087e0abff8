//! Full identity key material.
//!
//! An identity owns two unrelated halves:
//! - a signing half ([`SigningKeypair`]: Ed25519 + ML-DSA) that proves
//!   authorship
//! - a key-agreement half (X25519 + ML-KEM) that lets others wrap content
//!   keys for this identity
//!
//! The [`UserId`] is derived from the signing half only, so the
//! key-agreement half can rotate without changing who the user is.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{PublicKey as _, SecretKey as _};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{HavenError, HavenResult};
use crate::identity::did::UserId;
use crate::identity::keypair::{SigningKeypair, SigningPublicKey};
use crate::identity::signature::MessageSignature;

/// Private key material for one identity.
pub struct IdentityKeys {
    signing: SigningKeypair,
    x25519_secret: StaticSecret,
    mlkem_secret: kyber768::SecretKey,
    mlkem_public: kyber768::PublicKey,
}

impl IdentityKeys {
    /// Generate a complete fresh identity.
    pub fn generate() -> Self {
        let signing = SigningKeypair::generate();

        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
        let x25519_secret = StaticSecret::from(seed);

        let (mlkem_public, mlkem_secret) = kyber768::keypair();

        Self {
            signing,
            x25519_secret,
            mlkem_secret,
            mlkem_public,
        }
    }

    /// This identity's stable identifier.
    pub fn user_id(&self) -> UserId {
        UserId::from_signing_key(&self.signing.public_key())
    }

    /// Sign a message with the signing half.
    pub fn sign(&self, message: &[u8]) -> MessageSignature {
        self.signing.sign(message)
    }

    /// The public signing key.
    pub fn signing_public(&self) -> SigningPublicKey {
        self.signing.public_key()
    }

    /// The shareable public bundle for this identity.
    pub fn public_bundle(&self) -> PublicKeys {
        PublicKeys {
            signing: self.signing.public_key(),
            x25519: X25519PublicKey::from(&self.x25519_secret),
            mlkem: self.mlkem_public.clone(),
        }
    }

    /// The X25519 secret, used when unwrapping content keys.
    pub(crate) fn x25519_secret(&self) -> &StaticSecret {
        &self.x25519_secret
    }

    /// The ML-KEM secret, used when unwrapping content keys.
    pub(crate) fn mlkem_secret(&self) -> &kyber768::SecretKey {
        &self.mlkem_secret
    }

    /// Serialize the complete identity.
    ///
    /// Layout: `[len][signing][x25519: 32][len][mlkem_secret][len][mlkem_public]`
    /// with 4-byte LE length prefixes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let signing_bytes = self.signing.to_bytes();
        let mlkem_secret_bytes = self.mlkem_secret.as_bytes();
        let mlkem_public_bytes = self.mlkem_public.as_bytes();

        let mut bytes = Vec::with_capacity(
            4 + signing_bytes.len() + 32 + 4 + mlkem_secret_bytes.len() + 4
                + mlkem_public_bytes.len(),
        );
        bytes.extend_from_slice(&(signing_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&signing_bytes);
        bytes.extend_from_slice(&self.x25519_secret.to_bytes());
        bytes.extend_from_slice(&(mlkem_secret_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(mlkem_secret_bytes);
        bytes.extend_from_slice(&(mlkem_public_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(mlkem_public_bytes);
        bytes
    }

    /// Deserialize from the format produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::Identity`] on truncated or malformed input.
    pub fn from_bytes(bytes: &[u8]) -> HavenResult<Self> {
        let mut offset = 0;

        let signing_len = read_len(bytes, offset)?;
        offset += 4;
        let signing = SigningKeypair::from_bytes(field(bytes, offset, signing_len)?)?;
        offset += signing_len;

        let x25519_bytes: [u8; 32] = field(bytes, offset, 32)?
            .try_into()
            .map_err(|_| HavenError::Identity("Invalid X25519 secret".to_string()))?;
        let x25519_secret = StaticSecret::from(x25519_bytes);
        offset += 32;

        let mlkem_secret_len = read_len(bytes, offset)?;
        offset += 4;
        let mlkem_secret = kyber768::SecretKey::from_bytes(field(bytes, offset, mlkem_secret_len)?)
            .map_err(|e| HavenError::Identity(format!("Invalid ML-KEM secret key: {}", e)))?;
        offset += mlkem_secret_len;

        let mlkem_public_len = read_len(bytes, offset)?;
        offset += 4;
        let mlkem_public = kyber768::PublicKey::from_bytes(field(bytes, offset, mlkem_public_len)?)
            .map_err(|e| HavenError::Identity(format!("Invalid ML-KEM public key: {}", e)))?;

        Ok(Self {
            signing,
            x25519_secret,
            mlkem_secret,
            mlkem_public,
        })
    }
}

impl Clone for IdentityKeys {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.to_bytes()).expect("serialized identity always round-trips")
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("user_id", &self.user_id())
            .finish_non_exhaustive()
    }
}

/// Shareable public key bundle for one identity.
#[derive(Clone)]
pub struct PublicKeys {
    signing: SigningPublicKey,
    x25519: X25519PublicKey,
    mlkem: kyber768::PublicKey,
}

impl PublicKeys {
    /// The identifier derived from this bundle's signing key.
    pub fn user_id(&self) -> UserId {
        UserId::from_signing_key(&self.signing)
    }

    pub fn signing(&self) -> &SigningPublicKey {
        &self.signing
    }

    pub fn x25519(&self) -> &X25519PublicKey {
        &self.x25519
    }

    pub fn mlkem(&self) -> &kyber768::PublicKey {
        &self.mlkem
    }

    /// Serialize as `[len][signing][x25519: 32][len][mlkem]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let signing_bytes = self.signing.to_bytes();
        let mlkem_bytes = self.mlkem.as_bytes();

        let mut bytes =
            Vec::with_capacity(4 + signing_bytes.len() + 32 + 4 + mlkem_bytes.len());
        bytes.extend_from_slice(&(signing_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&signing_bytes);
        bytes.extend_from_slice(self.x25519.as_bytes());
        bytes.extend_from_slice(&(mlkem_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(mlkem_bytes);
        bytes
    }

    /// Deserialize from the format produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::Identity`] on truncated or malformed input.
    pub fn from_bytes(bytes: &[u8]) -> HavenResult<Self> {
        let mut offset = 0;

        let signing_len = read_len(bytes, offset)?;
        offset += 4;
        let signing = SigningPublicKey::from_bytes(field(bytes, offset, signing_len)?)?;
        offset += signing_len;

        let x25519_bytes: [u8; 32] = field(bytes, offset, 32)?
            .try_into()
            .map_err(|_| HavenError::Identity("Invalid X25519 public key".to_string()))?;
        let x25519 = X25519PublicKey::from(x25519_bytes);
        offset += 32;

        let mlkem_len = read_len(bytes, offset)?;
        offset += 4;
        let mlkem = kyber768::PublicKey::from_bytes(field(bytes, offset, mlkem_len)?)
            .map_err(|e| HavenError::Identity(format!("Invalid ML-KEM public key: {}", e)))?;

        Ok(Self {
            signing,
            x25519,
            mlkem,
        })
    }
}

impl PartialEq for PublicKeys {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKeys {}

impl std::fmt::Debug for PublicKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKeys")
            .field("user_id", &self.user_id())
            .finish()
    }
}

impl serde::Serialize for PublicKeys {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKeys {
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

fn field(bytes: &[u8], offset: usize, len: usize) -> HavenResult<&[u8]> {
    bytes
        .get(offset..offset + len)
        .ok_or_else(|| HavenError::Identity("Key data truncated".to_string()))
}
