//! Message records and their mutation rules.
//!
//! A [`MessageRecord`] is the stored form of one message: encrypted body,
//! detached signature, reaction sets and lifecycle flags. Mutations are
//! applied through the `apply_*` methods, which enforce the rules every
//! honest client follows:
//!
//! - only the sender may edit, and never after a delete
//! - only the sender may delete; delete-for-everyone also drops the body
//! - reactions are idempotent per (symbol, user)
//!
//! All `apply_*` methods return whether anything changed; callers republish
//! only on `true`. Expiry is a plain timestamp comparison enforced by
//! readers and the reaper, never by the record itself.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::envelope::SealedBody;
use crate::identity::{IdentityKeys, SigningPublicKey, UserId};
use crate::types::MessageId;

/// Closed set of message kinds.
///
/// Unknown kinds fail deserialization instead of flowing through as
/// arbitrary strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Text,
    System,
    ThreadReply,
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Text
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::System => "system",
            Self::ThreadReply => "thread-reply",
        };
        write!(f, "{}", name)
    }
}

/// Stored form of one message in a channel log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender: UserId,
    pub kind: MessageKind,
    /// Encrypted content plus signature; `None` after delete-for-everyone.
    pub body: Option<SealedBody>,
    /// Creation time, Unix milliseconds.
    pub timestamp: i64,
    /// `timestamp + expiry window`, fixed at creation. Edits do not extend
    /// a message's life.
    pub expires_at: i64,
    pub reply_to: Option<MessageId>,
    pub thread_id: Option<MessageId>,
    /// Reaction symbol to the set of users who reacted with it.
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub edited: bool,
    pub edit_timestamp: Option<i64>,
    pub deleted: bool,
    pub deleted_for_everyone: bool,
}

impl MessageRecord {
    /// Create a record timestamped now.
    pub fn new(
        sender: UserId,
        kind: MessageKind,
        body: SealedBody,
        expiry_window_ms: i64,
        reply_to: Option<MessageId>,
        thread_id: Option<MessageId>,
    ) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        Self {
            id: MessageId::new(),
            sender,
            kind,
            body: Some(body),
            timestamp,
            expires_at: timestamp + expiry_window_ms,
            reply_to,
            thread_id,
            reactions: BTreeMap::new(),
            edited: false,
            edit_timestamp: None,
            deleted: false,
            deleted_for_everyone: false,
        }
    }

    /// Replace the body with an edited version.
    ///
    /// Silent no-op unless `actor` is the sender and the record is not
    /// deleted. Returns whether the record changed.
    pub fn apply_edit(&mut self, new_body: SealedBody, actor: &UserId, now: i64) -> bool {
        if self.deleted || &self.sender != actor {
            return false;
        }

        self.body = Some(new_body);
        self.edited = true;
        self.edit_timestamp = Some(now);
        true
    }

    /// Mark the record deleted.
    ///
    /// Only the sender may delete, and a second delete of either flavor is
    /// a no-op. Delete-for-everyone also clears the body; a local delete
    /// leaves it in place for other readers.
    pub fn apply_delete(&mut self, actor: &UserId, for_everyone: bool) -> bool {
        if &self.sender != actor || self.deleted {
            return false;
        }

        self.deleted = true;
        self.deleted_for_everyone = for_everyone;
        if for_everyone {
            self.body = None;
        }
        true
    }

    /// Add `actor` to the reactor set for `symbol`.
    ///
    /// Idempotent: reacting twice with the same symbol changes nothing and
    /// returns `false`.
    pub fn apply_reaction(&mut self, symbol: &str, actor: UserId) -> bool {
        self.reactions
            .entry(symbol.to_string())
            .or_default()
            .insert(actor)
    }

    /// Whether this record has outlived its expiry window.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Decrypt and verify into a display-ready [`ChannelMessage`].
    ///
    /// Crypto failures never propagate: an undecryptable body becomes
    /// [`MessageContent::Undecryptable`], a decrypted body whose signature
    /// does not check out becomes [`MessageContent::Unverified`], each with
    /// the cause logged.
    pub fn to_channel_message(
        &self,
        keys: &IdentityKeys,
        sender_key: Option<&SigningPublicKey>,
    ) -> ChannelMessage {
        let content = match &self.body {
            None => MessageContent::Removed,
            Some(body) => match body.envelope.open(keys) {
                Err(e) => {
                    warn!(message_id = %self.id, error = %e, "Failed to decrypt message body");
                    MessageContent::Undecryptable
                }
                Ok(plaintext) => {
                    let verified = sender_key
                        .map(|key| key.verify(&plaintext, &body.signature))
                        .unwrap_or(false);

                    if !verified {
                        warn!(
                            message_id = %self.id,
                            sender = %self.sender,
                            "Signature verification failed for decrypted message"
                        );
                        MessageContent::Unverified
                    } else {
                        match String::from_utf8(plaintext) {
                            Ok(text) => MessageContent::Text(text),
                            Err(_) => {
                                warn!(message_id = %self.id, "Decrypted body is not valid UTF-8");
                                MessageContent::Undecryptable
                            }
                        }
                    }
                }
            },
        };

        ChannelMessage {
            id: self.id,
            sender: self.sender.clone(),
            kind: self.kind,
            content,
            timestamp: self.timestamp,
            reply_to: self.reply_to,
            thread_id: self.thread_id,
            reactions: self.reactions.clone(),
            edited: self.edited,
            edit_timestamp: self.edit_timestamp,
            deleted: self.deleted,
        }
    }
}

/// Decrypted content of one message, or the marker for why it could not
/// be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Decrypted and signature-verified text.
    Text(String),
    /// Deleted for everyone; no content exists in the log.
    Removed,
    /// The body could not be decrypted with this identity's keys.
    Undecryptable,
    /// The body decrypted but the sender's signature did not verify.
    Unverified,
}

impl std::fmt::Display for MessageContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{}", text),
            Self::Removed => write!(f, "[removed]"),
            Self::Undecryptable => write!(f, "[undecryptable]"),
            Self::Unverified => write!(f, "[unverified sender]"),
        }
    }
}

/// A decrypted, display-ready message as seen by one reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub kind: MessageKind,
    pub content: MessageContent,
    pub timestamp: i64,
    pub reply_to: Option<MessageId>,
    pub thread_id: Option<MessageId>,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub edited: bool,
    pub edit_timestamp: Option<i64>,
    pub deleted: bool,
}

impl ChannelMessage {
    /// Shortened sender identifier for display.
    pub fn display_sender(&self) -> String {
        let identifier = self.sender.identifier();
        if identifier.len() > 8 {
            format!("{}…", &identifier[..8])
        } else {
            identifier.to_string()
        }
    }

    /// Human-readable age of this message.
    pub fn relative_time(&self) -> String {
        let elapsed_ms = Utc::now().timestamp_millis() - self.timestamp;
        let elapsed_secs = elapsed_ms / 1000;

        if elapsed_secs < 60 {
            "just now".to_string()
        } else if elapsed_secs < 3600 {
            format!("{}m ago", elapsed_secs / 60)
        } else if elapsed_secs < 86400 {
            format!("{}h ago", elapsed_secs / 3600)
        } else {
            format!("{}d ago", elapsed_secs / 86400)
        }
    }

    /// Whether this message replies to another.
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}
