//! Haven Core Library
//!
//! End-to-end encrypted channel messaging over a dumb append-only log store.
//!
//! ## Overview
//!
//! Haven layers hybrid encryption and a mutable-message data model on top of
//! a store that only knows two operations per channel: publish a payload and
//! fetch the latest one. Messages are sealed per recipient with a fresh
//! content key, signed with hybrid signatures, batched on the send side, and
//! republished as whole-channel snapshots. Edits, deletes, reactions,
//! threads, and disappearing messages are all built client-side.
//!
//! ## Core Principles
//!
//! - **Dumb store**: the backend stores opaque bytes; no server-side logic
//! - **Hybrid crypto**: classical + post-quantum for both sealing and
//!   signing, with encryption keys never reused for signatures
//! - **Last writer wins**: whole-log republication, no compare-and-swap
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use haven_core::{MemoryLogStore, MessageKind, Messenger, MessengerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryLogStore::new());
//!     let messenger = Messenger::new("~/.haven/data", store, MessengerConfig::default())?;
//!     messenger.init_identity()?;
//!
//!     let channel = haven_core::ChannelId::new("general");
//!     messenger.register_channel(&channel, vec![])?;
//!
//!     messenger
//!         .send_message(&channel, "Hello!", MessageKind::Text, None, None)
//!         .await?;
//!     messenger.flush(&channel).await?;
//!
//!     for message in messenger.channel_messages(&channel).await? {
//!         println!("{}: {}", message.display_sender(), message.content);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod crypto;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod invite;
pub mod message;
pub mod reaper;
pub mod storage;
pub mod store;
pub mod sync;
pub mod types;

// Re-exports
pub use batch::BatchBuffer;
pub use crypto::{content_hash, ContentCrypto};
pub use engine::{Messenger, MessengerConfig, MessengerEvent};
pub use envelope::{Envelope, SealedBody, WrappedKey};
pub use error::{HavenError, HavenResult};
pub use identity::{IdentityKeys, MessageSignature, PublicKeys, SigningPublicKey, UserId};
pub use invite::{ChannelInvite, SignedInvite, INVITE_LIFETIME_MS};
pub use message::{ChannelMessage, MessageContent, MessageKind, MessageRecord};
pub use reaper::{ExpiryReaper, SweepStats};
pub use storage::Storage;
pub use store::{LogStore, MemoryLogStore, RedbLogStore};
pub use sync::{decode_snapshot, encode_snapshot, LogSynchronizer};
pub use types::{ChannelId, MessageId};
