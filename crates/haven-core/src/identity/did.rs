//! Decentralized identifiers for message senders.
//!
//! A [`UserId`] is derived from the signing public key bundle only, so
//! rotating encryption keys never changes who a user is. The format is
//! `did:haven:z{base58(blake3(signing public key bytes))}`.

use serde::{Deserialize, Serialize};

use crate::error::{HavenError, HavenResult};
use crate::identity::keypair::SigningPublicKey;

/// Method-and-multibase prefix of every Haven identifier.
const DID_PREFIX: &str = "did:haven:z";

/// A user's stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Derive the identifier for a signing public key.
    pub fn from_signing_key(key: &SigningPublicKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.ed25519_bytes());
        hasher.update(key.ml_dsa_bytes());
        let hash = hasher.finalize();

        let encoded = bs58::encode(hash.as_bytes()).into_string();
        Self(format!("{}{}", DID_PREFIX, encoded))
    }

    /// Parse and validate an identifier string.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::Identity`] if the string is not a well-formed
    /// `did:haven:z...` identifier.
    pub fn parse(s: &str) -> HavenResult<Self> {
        if !Self::is_valid_format(s) {
            return Err(HavenError::Identity(format!(
                "Malformed user id: '{}'",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// The full identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The base58 portion without the `did:haven:z` prefix.
    pub fn identifier(&self) -> &str {
        self.0.strip_prefix(DID_PREFIX).unwrap_or(&self.0)
    }

    fn is_valid_format(s: &str) -> bool {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        if parts.len() != 3 || parts[0] != "did" || parts[1] != "haven" {
            return false;
        }

        let Some(encoded) = parts[2].strip_prefix('z') else {
            return false;
        };
        if encoded.is_empty() {
            return false;
        }

        bs58::decode(encoded).into_vec().is_ok()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = HavenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
