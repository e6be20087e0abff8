//! Channel invites.
//!
//! An invite ticket names a channel, the identity that issued it, and a
//! validity window. The whole payload is signed with the inviter's hybrid
//! keys, so a recipient who already holds the inviter's public bundle can
//! check that the ticket is genuine before joining.
//!
//! Tickets are encoded as `haven-invite:{base58}` strings for easy sharing.

use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{HavenError, HavenResult};
use crate::identity::{IdentityKeys, MessageSignature, SigningPublicKey, UserId};
use crate::types::ChannelId;

/// Prefix for encoded invite strings
const INVITE_PREFIX: &str = "haven-invite:";

/// Current ticket version
const PROTOCOL_VERSION: u8 = 1;

/// How long a freshly issued invite stays valid (7 days, in milliseconds).
pub const INVITE_LIFETIME_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Wire form of a signed ticket: the postcard payload plus the signature
/// computed over exactly those bytes.
#[derive(Serialize, Deserialize)]
struct SignedTicket {
    payload: Vec<u8>,
    signature: MessageSignature,
}

/// An invitation to join a channel.
///
/// The ticket itself carries no key material; the recipient obtains the
/// member key bundles out of band and registers the channel locally.
/// Signing binds the channel, inviter, and validity window together so a
/// tampered ticket is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInvite {
    /// Ticket version (for future compatibility)
    pub version: u8,
    /// Unique identifier for this invite (for tracking/revocation)
    pub invite_id: [u8; 16],
    /// The channel being shared
    pub channel: ChannelId,
    /// Identity that issued and signed the ticket
    pub inviter: UserId,
    /// Human-readable channel name (optional)
    pub channel_name: Option<String>,
    /// Unix millisecond timestamp when the ticket was issued
    pub issued_at: i64,
    /// Unix millisecond timestamp after which the ticket is rejected
    pub expires_at: i64,
}

impl ChannelInvite {
    /// Create a new invite for a channel, valid for [`INVITE_LIFETIME_MS`].
    pub fn new(channel: ChannelId, inviter: UserId) -> Self {
        let mut invite_id = [0u8; 16];
        rand::rng().fill_bytes(&mut invite_id);

        let issued_at = Utc::now().timestamp_millis();
        Self {
            version: PROTOCOL_VERSION,
            invite_id,
            channel,
            inviter,
            channel_name: None,
            issued_at,
            expires_at: issued_at + INVITE_LIFETIME_MS,
        }
    }

    /// Set a human-readable name for the channel (builder pattern).
    pub fn with_name(mut self, name: &str) -> Self {
        self.channel_name = Some(name.to_string());
        self
    }

    /// Override the expiry time, Unix milliseconds (builder pattern).
    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Sign the ticket and encode it as a `haven-invite:{base58}` string.
    ///
    /// # Errors
    ///
    /// Returns `HavenError::SigningFailure` if `signer` is not the identity
    /// named as the inviter, and `HavenError::Serialization` if encoding
    /// fails.
    pub fn encode(&self, signer: &IdentityKeys) -> HavenResult<String> {
        if signer.user_id() != self.inviter {
            return Err(HavenError::SigningFailure(
                "Invite must be signed by its inviter".to_string(),
            ));
        }

        let payload = postcard::to_stdvec(self)
            .map_err(|e| HavenError::Serialization(format!("Failed to encode invite: {}", e)))?;
        let signature = signer.sign(&payload);

        let ticket = SignedTicket { payload, signature };
        let bytes = postcard::to_stdvec(&ticket)
            .map_err(|e| HavenError::Serialization(format!("Failed to encode invite: {}", e)))?;
        Ok(format!("{}{}", INVITE_PREFIX, bs58::encode(&bytes).into_string()))
    }

    /// Check if this invite's validity window has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() >= self.expires_at
    }
}

/// A decoded ticket whose signature has not yet been checked.
///
/// Decoding and verification are separate steps: the ticket names its
/// inviter, and the recipient looks up that identity's public bundle
/// before calling [`SignedInvite::validate`].
#[derive(Debug, Clone)]
pub struct SignedInvite {
    pub invite: ChannelInvite,
    signature: MessageSignature,
}

impl SignedInvite {
    /// Decode a ticket from a `haven-invite:{base58}` string.
    ///
    /// # Errors
    ///
    /// Returns `HavenError::InvalidInvite` if:
    /// - The string doesn't start with `haven-invite:`
    /// - The base58 encoding is invalid
    /// - The binary data is malformed
    pub fn decode(s: &str) -> HavenResult<Self> {
        let data = s.strip_prefix(INVITE_PREFIX).ok_or_else(|| {
            HavenError::InvalidInvite(format!(
                "Invalid prefix: expected '{}', got '{}'",
                INVITE_PREFIX,
                s.chars().take(15).collect::<String>()
            ))
        })?;

        let bytes = bs58::decode(data)
            .into_vec()
            .map_err(|e| HavenError::InvalidInvite(format!("Invalid base58: {}", e)))?;

        let ticket: SignedTicket = postcard::from_bytes(&bytes)
            .map_err(|e| HavenError::InvalidInvite(format!("Invalid ticket data: {}", e)))?;
        let invite: ChannelInvite = postcard::from_bytes(&ticket.payload)
            .map_err(|e| HavenError::InvalidInvite(format!("Invalid ticket data: {}", e)))?;

        Ok(Self {
            invite,
            signature: ticket.signature,
        })
    }

    /// Check the ticket signature against the inviter's verifying key.
    pub fn verify(&self, inviter: &SigningPublicKey) -> bool {
        match postcard::to_stdvec(&self.invite) {
            Ok(payload) => inviter.verify(&payload, &self.signature),
            Err(_) => false,
        }
    }

    /// Full acceptance check: the key belongs to the named inviter, the
    /// signature holds, and the validity window has not passed.
    ///
    /// # Errors
    ///
    /// Returns `HavenError::InvalidInvite` describing the first check that
    /// failed.
    pub fn validate(&self, inviter: &SigningPublicKey) -> HavenResult<()> {
        if UserId::from_signing_key(inviter) != self.invite.inviter {
            return Err(HavenError::InvalidInvite(
                "Invite signed by a different identity".to_string(),
            ));
        }
        if !self.verify(inviter) {
            return Err(HavenError::InvalidInvite(
                "Invite signature rejected".to_string(),
            ));
        }
        if self.invite.is_expired() {
            return Err(HavenError::InvalidInvite(format!(
                "Invite expired at {}",
                self.invite.expires_at
            )));
        }
        Ok(())
    }
}
