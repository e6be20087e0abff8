//! Detached hybrid signature carried alongside each encrypted message body.

use ed25519_dalek::Signature as Ed25519Signature;
use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::SignedMessage as _;

use crate::error::{HavenError, HavenResult};

/// Hybrid signature: Ed25519 plus ML-DSA over the same plaintext.
///
/// Both components must verify for the signature to be accepted.
#[derive(Clone)]
pub struct MessageSignature {
    ed25519: Ed25519Signature,
    ml_dsa: dilithium5::SignedMessage,
}

impl MessageSignature {
    pub fn new(ed25519: Ed25519Signature, ml_dsa: dilithium5::SignedMessage) -> Self {
        Self { ed25519, ml_dsa }
    }

    pub fn ed25519(&self) -> &Ed25519Signature {
        &self.ed25519
    }

    pub fn ml_dsa(&self) -> &dilithium5::SignedMessage {
        &self.ml_dsa
    }

    /// Serialize as `[ed25519: 64 bytes][ml_dsa_len: 4 bytes LE][ml_dsa]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ml_dsa_bytes = self.ml_dsa.as_bytes();

        let mut bytes = Vec::with_capacity(64 + 4 + ml_dsa_bytes.len());
        bytes.extend_from_slice(&self.ed25519.to_bytes());
        bytes.extend_from_slice(&(ml_dsa_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(ml_dsa_bytes);
        bytes
    }

    /// Deserialize from the format produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::Serialization`] if the input is truncated or
    /// the ML-DSA component is malformed.
    pub fn from_bytes(bytes: &[u8]) -> HavenResult<Self> {
        if bytes.len() < 68 {
            return Err(HavenError::Serialization(
                "Signature data too short".to_string(),
            ));
        }

        let ed25519_bytes: [u8; 64] = bytes[..64]
            .try_into()
            .map_err(|_| HavenError::Serialization("Invalid ed25519 signature".to_string()))?;
        let ed25519 = Ed25519Signature::from_bytes(&ed25519_bytes);

        let ml_dsa_len =
            u32::from_le_bytes([bytes[64], bytes[65], bytes[66], bytes[67]]) as usize;
        if bytes.len() < 68 + ml_dsa_len {
            return Err(HavenError::Serialization(
                "Signature data truncated".to_string(),
            ));
        }

        let ml_dsa = dilithium5::SignedMessage::from_bytes(&bytes[68..68 + ml_dsa_len])
            .map_err(|e| HavenError::Serialization(format!("Invalid ML-DSA signature: {}", e)))?;

        Ok(Self { ed25519, ml_dsa })
    }
}

impl std::fmt::Debug for MessageSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSignature")
            .field("ed25519", &hex::encode(self.ed25519.to_bytes()))
            .field("ml_dsa_len", &self.ml_dsa.as_bytes().len())
            .finish()
    }
}

impl serde::Serialize for MessageSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for MessageSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
