//! Main Messenger engine - the primary entry point for Haven.
//!
//! Messenger coordinates Storage, the BatchBuffer, the LogSynchronizer,
//! and the ExpiryReaper for:
//! - Device identity (hybrid encryption + signing keys)
//! - The local channel directory (member key bundles per channel)
//! - Sending, reading, and mutating encrypted messages over a log store
//!
//! # Example
//!
//! ```ignore
//! use haven_core::{Messenger, MessengerConfig, MemoryLogStore};
//!
//! let store = Arc::new(MemoryLogStore::new());
//! let messenger = Messenger::new("~/.haven/data", store, MessengerConfig::default())?;
//! messenger.init_identity()?;
//!
//! // Register a channel with its members' public bundles
//! messenger.register_channel(&channel, vec![bob_bundle])?;
//!
//! // Send and force-flush
//! messenger.send_message(&channel, "Hello Bob!", MessageKind::Text, None, None).await?;
//! messenger.flush(&channel).await?;
//!
//! // Read back decrypted history
//! let messages = messenger.channel_messages(&channel).await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::batch::BatchBuffer;
use crate::envelope::SealedBody;
use crate::error::{HavenError, HavenResult};
use crate::identity::{IdentityKeys, PublicKeys, UserId};
use crate::invite::{ChannelInvite, SignedInvite};
use crate::message::{ChannelMessage, MessageKind, MessageRecord};
use crate::reaper::{ExpiryReaper, SweepStats};
use crate::storage::Storage;
use crate::store::LogStore;
use crate::sync::LogSynchronizer;
use crate::types::{ChannelId, MessageId};

/// Default capacity for event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunable engine parameters.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Pending records that trigger an immediate batch flush
    pub batch_size: usize,
    /// How long a partial batch waits before flushing on its own
    pub batch_timeout: Duration,
    /// Lifetime of every sent message, in milliseconds
    pub expiry_window_ms: i64,
    /// How often the background reaper sweeps for expired records
    pub sweep_interval: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout: Duration::from_secs(5),
            expiry_window_ms: 7 * 24 * 60 * 60 * 1000,
            sweep_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Events emitted by the engine.
///
/// Delivered over a bounded broadcast channel; lagging subscribers miss
/// events rather than block the engine.
#[derive(Debug, Clone)]
pub enum MessengerEvent {
    /// A record entered a channel's pending batch
    MessageQueued {
        /// The channel the record was queued for
        channel: ChannelId,
        /// The queued record's id
        id: MessageId,
    },
    /// A batch of records reached the log store
    BatchFlushed {
        /// The channel that was flushed
        channel: ChannelId,
        /// Records in the published batch
        count: usize,
    },
    /// An expiry sweep finished
    SweepCompleted {
        /// Counts from the completed sweep
        stats: SweepStats,
    },
}

/// Main entry point for Haven.
///
/// Messenger manages:
/// - The device identity, loaded from or persisted to local storage
/// - The channel directory mapping channels to member key bundles
/// - Encrypted sends through the batch buffer and log synchronizer
/// - Decrypted reads with per-message failure isolation
pub struct Messenger<S: LogStore> {
    /// Local device state (identity, channel directory)
    storage: Storage,
    /// Snapshot read/write layer over the log store
    synchronizer: Arc<LogSynchronizer<S>>,
    /// Per-channel send batching
    buffer: BatchBuffer<S>,
    /// Expired-record sweeper
    reaper: Arc<ExpiryReaper<S>>,
    /// Device identity (lazy-initialized)
    identity: RwLock<Option<IdentityKeys>>,
    /// Data directory path
    data_dir: PathBuf,
    /// Event broadcast channel for notifying listeners
    event_tx: broadcast::Sender<MessengerEvent>,
}

impl<S: LogStore + 'static> Messenger<S> {
    /// Create a new Messenger with the given data directory and log store.
    ///
    /// This will:
    /// - Create the data directory if it doesn't exist
    /// - Initialize the device state database
    /// - Wire the batch buffer and reaper to the store
    ///
    /// Identity is not loaded here; call [`Messenger::init_identity`] before
    /// any operation that signs or decrypts.
    pub fn new(
        data_dir: impl AsRef<Path>,
        store: Arc<S>,
        config: MessengerConfig,
    ) -> HavenResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        info!(?data_dir, "Initializing Messenger");

        std::fs::create_dir_all(&data_dir)?;
        let storage = Storage::new(data_dir.join("haven.redb"))?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let synchronizer = Arc::new(LogSynchronizer::new(
            Arc::clone(&store),
            config.expiry_window_ms,
        ));
        let buffer = BatchBuffer::new(
            Arc::clone(&synchronizer),
            config.batch_size,
            config.batch_timeout,
            event_tx.clone(),
        );
        let reaper = Arc::new(ExpiryReaper::new(
            store,
            config.sweep_interval,
            event_tx.clone(),
        ));

        Ok(Self {
            storage,
            synchronizer,
            buffer,
            reaper,
            identity: RwLock::new(None),
            data_dir,
            event_tx,
        })
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Initialize identity, loading from storage or generating a new one.
    ///
    /// If an identity already exists in storage, it is loaded. Otherwise, a
    /// new identity is generated and persisted.
    pub fn init_identity(&self) -> HavenResult<()> {
        if self.identity.read().is_some() {
            return Ok(());
        }

        if let Some(keys) = self.storage.load_identity()? {
            info!(user_id = %keys.user_id(), "Loaded existing identity");
            *self.identity.write() = Some(keys);
        } else {
            let keys = IdentityKeys::generate();
            self.storage.save_identity(&keys)?;
            info!(user_id = %keys.user_id(), "Generated new identity");
            *self.identity.write() = Some(keys);
        }

        Ok(())
    }

    /// Get the user id for this device.
    ///
    /// Returns `None` if identity has not been initialized.
    /// Call `init_identity()` first to ensure identity is available.
    pub fn user_id(&self) -> Option<UserId> {
        self.identity.read().as_ref().map(|keys| keys.user_id())
    }

    /// Get the shareable public key bundle for this device.
    ///
    /// Returns `None` if identity has not been initialized.
    pub fn public_keys(&self) -> Option<PublicKeys> {
        self.identity.read().as_ref().map(|keys| keys.public_bundle())
    }

    /// Check if identity has been initialized.
    pub fn has_identity(&self) -> bool {
        self.identity.read().is_some()
    }

    /// Regenerate identity (WARNING: irreversible).
    ///
    /// This will generate new key pairs and replace the existing ones.
    /// Messages sealed for the old keys become undecryptable, and records
    /// signed with them will no longer verify as this user. Every stored
    /// channel roster is rewritten with the new bundle in place of the
    /// retired one, so later sends to known channels stay readable here.
    pub fn regenerate_identity(&self) -> HavenResult<()> {
        warn!("Regenerating identity - this is irreversible!");
        let old_id = self.user_id();
        let keys = IdentityKeys::generate();
        self.storage.save_identity(&keys)?;

        let bundle = keys.public_bundle();
        for channel in self.storage.list_channels()? {
            if let Some(mut members) = self.storage.load_channel(&channel)? {
                members.retain(|m| Some(m.user_id()) != old_id);
                members.push(bundle.clone());
                self.storage.save_channel(&channel, &members)?;
            }
        }

        info!(user_id = %keys.user_id(), "New identity generated");
        *self.identity.write() = Some(keys);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Channel Directory Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a channel with its members' public key bundles.
    ///
    /// The device's own bundle is added automatically if missing, so a
    /// sender can always decrypt their own messages. Registering an
    /// already-known channel overwrites its member list.
    pub fn register_channel(
        &self,
        channel: &ChannelId,
        mut members: Vec<PublicKeys>,
    ) -> HavenResult<()> {
        {
            let identity = self.identity.read();
            if let Some(keys) = identity.as_ref() {
                let own = keys.user_id();
                if !members.iter().any(|m| m.user_id() == own) {
                    members.push(keys.public_bundle());
                }
            }
        }

        if members.is_empty() {
            return Err(HavenError::InvalidOperation(
                "A channel needs at least one member".to_string(),
            ));
        }

        self.storage.save_channel(channel, &members)?;
        info!(channel = %channel, members = members.len(), "Registered channel");
        Ok(())
    }

    /// Get a channel's member key bundles.
    ///
    /// Returns `None` if the channel is not registered on this device.
    pub fn channel_members(&self, channel: &ChannelId) -> HavenResult<Option<Vec<PublicKeys>>> {
        self.storage.load_channel(channel)
    }

    /// List every channel registered on this device.
    pub fn list_channels(&self) -> HavenResult<Vec<ChannelId>> {
        self.storage.list_channels()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt, sign, and queue a message for the channel.
    ///
    /// The content is sealed for every registered member and the record
    /// enters the channel's pending batch; it reaches the store when the
    /// batch flushes. A crypto failure aborts the send with nothing queued.
    ///
    /// # Errors
    ///
    /// Returns `HavenError::Identity` if identity is not initialized,
    /// `HavenError::InvalidOperation` if the channel is not registered, and
    /// any sealing or publish error unchanged.
    pub async fn send_message(
        &self,
        channel: &ChannelId,
        content: &str,
        kind: MessageKind,
        reply_to: Option<MessageId>,
        thread_id: Option<MessageId>,
    ) -> HavenResult<MessageId> {
        let record = {
            let identity = self.identity.read();
            let keys = identity.as_ref().ok_or_else(|| {
                HavenError::Identity("No identity initialized; call init_identity first".to_string())
            })?;

            let members = self.storage.load_channel(channel)?.ok_or_else(|| {
                HavenError::InvalidOperation(format!("Channel '{}' is not registered", channel))
            })?;

            let body = SealedBody::seal(content.as_bytes(), &members, keys)?;
            MessageRecord::new(
                keys.user_id(),
                kind,
                body,
                self.synchronizer.expiry_window_ms(),
                reply_to,
                thread_id,
            )
        };

        let id = record.id;
        self.buffer.enqueue(channel, record).await?;
        let _ = self.event_tx.send(MessengerEvent::MessageQueued {
            channel: channel.clone(),
            id,
        });
        Ok(id)
    }

    /// Send a reply into a message's thread.
    pub async fn create_thread(
        &self,
        channel: &ChannelId,
        parent: MessageId,
        content: &str,
    ) -> HavenResult<MessageId> {
        self.send_message(channel, content, MessageKind::ThreadReply, None, Some(parent))
            .await
    }

    /// Replace a message's content with a re-sealed, re-signed body.
    ///
    /// Only the sender's own undeleted messages change; anything else is a
    /// silent no-op returning `false` with no store traffic.
    pub async fn edit_message(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        new_content: &str,
    ) -> HavenResult<bool> {
        let (new_body, actor) = {
            let identity = self.identity.read();
            let keys = identity.as_ref().ok_or_else(|| {
                HavenError::Identity("No identity initialized; call init_identity first".to_string())
            })?;

            let members = self.storage.load_channel(channel)?.ok_or_else(|| {
                HavenError::InvalidOperation(format!("Channel '{}' is not registered", channel))
            })?;

            let body = SealedBody::seal(new_content.as_bytes(), &members, keys)?;
            (body, keys.user_id())
        };

        let now = Utc::now().timestamp_millis();
        self.synchronizer
            .apply_mutation(channel, id, move |record| {
                record.apply_edit(new_body, &actor, now)
            })
            .await
    }

    /// Delete a message, locally or for everyone.
    ///
    /// Delete-for-everyone strips the encrypted body from the published
    /// record. Only the sender may delete; repeat deletes are no-ops.
    pub async fn delete_message(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        for_everyone: bool,
    ) -> HavenResult<bool> {
        let actor = self.user_id().ok_or_else(|| {
            HavenError::Identity("No identity initialized; call init_identity first".to_string())
        })?;

        self.synchronizer
            .apply_mutation(channel, id, move |record| {
                record.apply_delete(&actor, for_everyone)
            })
            .await
    }

    /// React to a message with a symbol. Idempotent per user and symbol.
    pub async fn react_to_message(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        symbol: &str,
    ) -> HavenResult<bool> {
        let actor = self.user_id().ok_or_else(|| {
            HavenError::Identity("No identity initialized; call init_identity first".to_string())
        })?;

        let symbol = symbol.to_string();
        self.synchronizer
            .apply_mutation(channel, id, move |record| {
                record.apply_reaction(&symbol, actor)
            })
            .await
    }

    /// Read a channel's history, decrypted and verified.
    ///
    /// Expired records are filtered out. Per-message crypto failure is
    /// caught and rendered as `Undecryptable` or `Unverified`; one bad
    /// record never aborts the read.
    pub async fn channel_messages(&self, channel: &ChannelId) -> HavenResult<Vec<ChannelMessage>> {
        let records = self.synchronizer.read(channel).await?;
        let members = self.storage.load_channel(channel)?.unwrap_or_default();

        let identity = self.identity.read();
        let keys = identity.as_ref().ok_or_else(|| {
            HavenError::Identity("No identity initialized; call init_identity first".to_string())
        })?;

        Ok(records
            .iter()
            .map(|record| {
                let sender_key = members
                    .iter()
                    .find(|m| m.user_id() == record.sender)
                    .map(|m| m.signing());
                record.to_channel_message(keys, sender_key)
            })
            .collect())
    }

    /// Read the replies threaded under one parent message.
    pub async fn thread_messages(
        &self,
        channel: &ChannelId,
        thread_id: MessageId,
    ) -> HavenResult<Vec<ChannelMessage>> {
        let messages = self.channel_messages(channel).await?;
        Ok(messages
            .into_iter()
            .filter(|m| m.thread_id == Some(thread_id))
            .collect())
    }

    /// Force-flush the channel's pending batch.
    ///
    /// Short-lived processes call this before exiting so queued sends are
    /// not stranded in memory. Returns the number of records published.
    pub async fn flush(&self, channel: &ChannelId) -> HavenResult<usize> {
        self.buffer.flush(channel).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Expiry Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one expiry sweep across all known channels now.
    pub async fn sweep_now(&self) -> HavenResult<SweepStats> {
        self.reaper.sweep().await
    }

    /// Start the background reaper loop.
    ///
    /// The returned handle can be aborted to stop it.
    pub fn start_reaper(&self) -> JoinHandle<()> {
        Arc::clone(&self.reaper).start()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Invite Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Issue a signed invite ticket for a registered channel.
    pub fn create_invite(
        &self,
        channel: &ChannelId,
        name: Option<&str>,
    ) -> HavenResult<String> {
        let identity = self.identity.read();
        let keys = identity.as_ref().ok_or_else(|| {
            HavenError::Identity("No identity initialized; call init_identity first".to_string())
        })?;

        if self.storage.load_channel(channel)?.is_none() {
            return Err(HavenError::InvalidOperation(format!(
                "Channel '{}' is not registered",
                channel
            )));
        }

        let mut invite = ChannelInvite::new(channel.clone(), keys.user_id());
        if let Some(name) = name {
            invite = invite.with_name(name);
        }
        invite.encode(keys)
    }

    /// Accept an invite ticket and register its channel locally.
    ///
    /// The ticket must carry a valid signature from `inviter` and be within
    /// its validity window. `members` are the channel's key bundles obtained
    /// out of band; the inviter's bundle is added if missing.
    pub fn accept_invite(
        &self,
        ticket: &str,
        inviter: &PublicKeys,
        mut members: Vec<PublicKeys>,
    ) -> HavenResult<ChannelInvite> {
        let signed = SignedInvite::decode(ticket)?;
        signed.validate(inviter.signing())?;

        if !members.iter().any(|m| m.user_id() == signed.invite.inviter) {
            members.push(inviter.clone());
        }
        self.register_channel(&signed.invite.channel, members)?;

        info!(
            channel = %signed.invite.channel,
            inviter = %signed.invite.inviter,
            "Joined channel via invite"
        );
        Ok(signed.invite)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Events
    // ═══════════════════════════════════════════════════════════════════════

    /// Subscribe to engine events.
    ///
    /// Returns a broadcast receiver; each subscriber gets every event from
    /// the point of subscription. Slow subscribers lag and miss events
    /// rather than block the engine.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MessengerEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageContent;
    use crate::store::MemoryLogStore;
    use crate::sync::{decode_snapshot, encode_snapshot};
    use tempfile::TempDir;

    fn create_test_messenger() -> (Messenger<MemoryLogStore>, MemoryLogStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryLogStore::new();
        let messenger = Messenger::new(
            temp_dir.path(),
            Arc::new(store.clone()),
            MessengerConfig::default(),
        )
        .unwrap();
        (messenger, store, temp_dir)
    }

    /// A second device on the same shared store, with its own data dir.
    fn join_store(store: &MemoryLogStore) -> (Messenger<MemoryLogStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let messenger = Messenger::new(
            temp_dir.path(),
            Arc::new(store.clone()),
            MessengerConfig::default(),
        )
        .unwrap();
        messenger.init_identity().unwrap();
        (messenger, temp_dir)
    }

    #[tokio::test]
    async fn test_messenger_creates() {
        let (messenger, _store, _temp) = create_test_messenger();
        assert!(!messenger.has_identity());
        assert!(messenger.list_channels().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_identity_loads_or_generates() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryLogStore::new();

        let user_id = {
            let messenger = Messenger::new(
                temp_dir.path(),
                Arc::new(store.clone()),
                MessengerConfig::default(),
            )
            .unwrap();
            messenger.init_identity().unwrap();
            let id = messenger.user_id().unwrap();

            // A second init is a no-op
            messenger.init_identity().unwrap();
            assert_eq!(messenger.user_id().unwrap(), id);
            id
        };

        // A fresh engine over the same data dir loads the same identity
        let messenger = Messenger::new(
            temp_dir.path(),
            Arc::new(store.clone()),
            MessengerConfig::default(),
        )
        .unwrap();
        messenger.init_identity().unwrap();
        assert_eq!(messenger.user_id().unwrap(), user_id);
    }

    #[tokio::test]
    async fn test_regenerate_identity_replaces() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let before = messenger.user_id().unwrap();

        messenger.regenerate_identity().unwrap();
        assert_ne!(messenger.user_id().unwrap(), before);
    }

    #[tokio::test]
    async fn test_regenerate_identity_rewrites_rosters() {
        let (messenger, store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let (bob, _bob_temp) = join_store(&store);
        let bob_id = bob.user_id().unwrap();

        let garden = ChannelId::new("garden");
        let workshop = ChannelId::new("workshop");
        messenger
            .register_channel(&garden, vec![bob.public_keys().unwrap()])
            .unwrap();
        messenger.register_channel(&workshop, vec![]).unwrap();

        let old_id = messenger.user_id().unwrap();
        messenger.regenerate_identity().unwrap();
        let new_id = messenger.user_id().unwrap();

        // Both rosters carry the new bundle instead of the retired one;
        // other members are untouched.
        let members = messenger.channel_members(&garden).unwrap().unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.user_id() == new_id));
        assert!(members.iter().any(|m| m.user_id() == bob_id));
        assert!(members.iter().all(|m| m.user_id() != old_id));

        let members = messenger.channel_members(&workshop).unwrap().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id(), new_id);

        // A send after regeneration seals for the new key and reads back.
        messenger
            .send_message(&workshop, "fresh start", MessageKind::Text, None, None)
            .await
            .unwrap();
        messenger.flush(&workshop).await.unwrap();

        let messages = messenger.channel_messages(&workshop).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, MessageContent::Text("fresh start".to_string()));
    }

    #[tokio::test]
    async fn test_send_requires_identity() {
        let (messenger, _store, _temp) = create_test_messenger();

        let err = messenger
            .send_message(&ChannelId::new("general"), "hi", MessageKind::Text, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HavenError::Identity(_)));
    }

    #[tokio::test]
    async fn test_send_requires_registered_channel() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();

        let err = messenger
            .send_message(&ChannelId::new("unknown"), "hi", MessageKind::Text, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HavenError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_send_flush_read_roundtrip() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let channel = ChannelId::new("general");
        messenger.register_channel(&channel, vec![]).unwrap();

        let id = messenger
            .send_message(&channel, "Hello channel", MessageKind::Text, None, None)
            .await
            .unwrap();
        assert_eq!(messenger.flush(&channel).await.unwrap(), 1);

        let messages = messenger.channel_messages(&channel).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert_eq!(messages[0].sender, messenger.user_id().unwrap());
        assert_eq!(messages[0].kind, MessageKind::Text);
        assert_eq!(messages[0].content, MessageContent::Text("Hello channel".to_string()));
        assert!(!messages[0].edited);
    }

    #[tokio::test]
    async fn test_register_channel_includes_self() {
        let (messenger, store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let (bob, _bob_temp) = join_store(&store);

        let channel = ChannelId::new("general");
        messenger
            .register_channel(&channel, vec![bob.public_keys().unwrap()])
            .unwrap();

        let members = messenger.channel_members(&channel).unwrap().unwrap();
        let own = messenger.user_id().unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.user_id() == own));
    }

    #[tokio::test]
    async fn test_two_party_messaging() {
        let (alice, store, _alice_temp) = create_test_messenger();
        alice.init_identity().unwrap();
        let (bob, _bob_temp) = join_store(&store);

        let channel = ChannelId::new("general");
        let roster = vec![alice.public_keys().unwrap(), bob.public_keys().unwrap()];
        alice.register_channel(&channel, roster.clone()).unwrap();
        bob.register_channel(&channel, roster).unwrap();

        alice
            .send_message(&channel, "Hello Bob!", MessageKind::Text, None, None)
            .await
            .unwrap();
        alice.flush(&channel).await.unwrap();

        let messages = bob.channel_messages(&channel).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, alice.user_id().unwrap());
        assert_eq!(messages[0].content, MessageContent::Text("Hello Bob!".to_string()));
    }

    #[tokio::test]
    async fn test_outsider_cannot_read() {
        let (alice, store, _alice_temp) = create_test_messenger();
        alice.init_identity().unwrap();
        let (bob, _bob_temp) = join_store(&store);
        let (cara, _cara_temp) = join_store(&store);

        let channel = ChannelId::new("private");
        // Alice seals for herself and Bob only
        alice
            .register_channel(
                &channel,
                vec![alice.public_keys().unwrap(), bob.public_keys().unwrap()],
            )
            .unwrap();
        alice
            .send_message(&channel, "secret", MessageKind::Text, None, None)
            .await
            .unwrap();
        alice.flush(&channel).await.unwrap();

        // Cara knows everyone's public bundles but holds no wrapped key
        cara.register_channel(
            &channel,
            vec![
                alice.public_keys().unwrap(),
                bob.public_keys().unwrap(),
                cara.public_keys().unwrap(),
            ],
        )
        .unwrap();

        let messages = cara.channel_messages(&channel).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, MessageContent::Undecryptable);
    }

    #[tokio::test]
    async fn test_edit_message() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let channel = ChannelId::new("general");
        messenger.register_channel(&channel, vec![]).unwrap();

        let id = messenger
            .send_message(&channel, "first draft", MessageKind::Text, None, None)
            .await
            .unwrap();
        messenger.flush(&channel).await.unwrap();

        let changed = messenger.edit_message(&channel, &id, "final draft").await.unwrap();
        assert!(changed);

        let messages = messenger.channel_messages(&channel).await.unwrap();
        assert_eq!(messages[0].content, MessageContent::Text("final draft".to_string()));
        assert!(messages[0].edited);
        assert!(messages[0].edit_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_edit_by_non_sender_is_noop() {
        let (alice, store, _alice_temp) = create_test_messenger();
        alice.init_identity().unwrap();
        let (bob, _bob_temp) = join_store(&store);

        let channel = ChannelId::new("general");
        let roster = vec![alice.public_keys().unwrap(), bob.public_keys().unwrap()];
        alice.register_channel(&channel, roster.clone()).unwrap();
        bob.register_channel(&channel, roster).unwrap();

        let id = alice
            .send_message(&channel, "alice's words", MessageKind::Text, None, None)
            .await
            .unwrap();
        alice.flush(&channel).await.unwrap();

        let changed = bob.edit_message(&channel, &id, "bob's forgery").await.unwrap();
        assert!(!changed);

        let messages = alice.channel_messages(&channel).await.unwrap();
        assert_eq!(messages[0].content, MessageContent::Text("alice's words".to_string()));
        assert!(!messages[0].edited);
    }

    #[tokio::test]
    async fn test_delete_for_everyone() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let channel = ChannelId::new("general");
        messenger.register_channel(&channel, vec![]).unwrap();

        let id = messenger
            .send_message(&channel, "regrettable", MessageKind::Text, None, None)
            .await
            .unwrap();
        messenger.flush(&channel).await.unwrap();

        assert!(messenger.delete_message(&channel, &id, true).await.unwrap());

        let messages = messenger.channel_messages(&channel).await.unwrap();
        assert_eq!(messages[0].content, MessageContent::Removed);
        assert!(messages[0].deleted);

        // Second delete of either flavor changes nothing
        assert!(!messenger.delete_message(&channel, &id, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_react_is_idempotent() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let channel = ChannelId::new("general");
        messenger.register_channel(&channel, vec![]).unwrap();

        let id = messenger
            .send_message(&channel, "react to me", MessageKind::Text, None, None)
            .await
            .unwrap();
        messenger.flush(&channel).await.unwrap();

        assert!(messenger.react_to_message(&channel, &id, "👍").await.unwrap());
        assert!(!messenger.react_to_message(&channel, &id, "👍").await.unwrap());

        let messages = messenger.channel_messages(&channel).await.unwrap();
        assert_eq!(messages[0].reactions.get("👍").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mutation_on_absent_id_is_noop() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let channel = ChannelId::new("general");
        messenger.register_channel(&channel, vec![]).unwrap();

        let ghost = MessageId::new();
        assert!(!messenger.edit_message(&channel, &ghost, "nothing").await.unwrap());
        assert!(!messenger.delete_message(&channel, &ghost, true).await.unwrap());
        assert!(!messenger.react_to_message(&channel, &ghost, "👻").await.unwrap());
    }

    #[tokio::test]
    async fn test_thread_messages() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let channel = ChannelId::new("general");
        messenger.register_channel(&channel, vec![]).unwrap();

        let parent = messenger
            .send_message(&channel, "thread root", MessageKind::Text, None, None)
            .await
            .unwrap();
        messenger.create_thread(&channel, parent, "first reply").await.unwrap();
        messenger.create_thread(&channel, parent, "second reply").await.unwrap();
        messenger.flush(&channel).await.unwrap();

        let thread = messenger.thread_messages(&channel, parent).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert!(thread.iter().all(|m| m.kind == MessageKind::ThreadReply));
        assert!(thread.iter().all(|m| m.thread_id == Some(parent)));

        // The root itself is not part of its thread
        let all = messenger.channel_messages(&channel).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let channel = ChannelId::new("general");
        messenger.register_channel(&channel, vec![]).unwrap();

        let mut events = messenger.subscribe_events();

        let id = messenger
            .send_message(&channel, "observe me", MessageKind::Text, None, None)
            .await
            .unwrap();
        messenger.flush(&channel).await.unwrap();

        match events.recv().await.unwrap() {
            MessengerEvent::MessageQueued { channel: c, id: queued } => {
                assert_eq!(c, channel);
                assert_eq!(queued, id);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await.unwrap() {
            MessengerEvent::BatchFlushed { count, .. } => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invite_flow() {
        let (alice, store, _alice_temp) = create_test_messenger();
        alice.init_identity().unwrap();
        let (bob, _bob_temp) = join_store(&store);

        let channel = ChannelId::new("garden");
        alice.register_channel(&channel, vec![]).unwrap();
        let ticket = alice.create_invite(&channel, Some("The Garden")).unwrap();

        let invite = bob
            .accept_invite(&ticket, &alice.public_keys().unwrap(), vec![])
            .unwrap();
        assert_eq!(invite.channel, channel);
        assert_eq!(invite.channel_name, Some("The Garden".to_string()));

        assert!(bob.list_channels().unwrap().contains(&channel));
        let members = bob.channel_members(&channel).unwrap().unwrap();
        assert!(members.iter().any(|m| m.user_id() == alice.user_id().unwrap()));
        assert!(members.iter().any(|m| m.user_id() == bob.user_id().unwrap()));
    }

    #[tokio::test]
    async fn test_accept_invite_rejects_wrong_inviter() {
        let (alice, store, _alice_temp) = create_test_messenger();
        alice.init_identity().unwrap();
        let (bob, _bob_temp) = join_store(&store);
        let (cara, _cara_temp) = join_store(&store);

        let channel = ChannelId::new("garden");
        alice.register_channel(&channel, vec![]).unwrap();
        let ticket = alice.create_invite(&channel, None).unwrap();

        let err = bob
            .accept_invite(&ticket, &cara.public_keys().unwrap(), vec![])
            .unwrap_err();
        assert!(matches!(err, HavenError::InvalidInvite(_)));
    }

    #[tokio::test]
    async fn test_create_invite_requires_registered_channel() {
        let (messenger, _store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();

        let err = messenger.create_invite(&ChannelId::new("nowhere"), None).unwrap_err();
        assert!(matches!(err, HavenError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_sweep_now_drops_expired() {
        let (messenger, store, _temp) = create_test_messenger();
        messenger.init_identity().unwrap();
        let channel = ChannelId::new("general");
        messenger.register_channel(&channel, vec![]).unwrap();

        // Plant one record already past its window behind the engine's back
        let identity = IdentityKeys::generate();
        let body = SealedBody::seal(b"stale", &[identity.public_bundle()], &identity).unwrap();
        let mut record = MessageRecord::new(
            identity.user_id(),
            MessageKind::Text,
            body,
            7 * 24 * 60 * 60 * 1000,
            None,
            None,
        );
        record.timestamp -= 8 * 24 * 60 * 60 * 1000;
        record.expires_at -= 8 * 24 * 60 * 60 * 1000;
        store
            .publish(&channel, encode_snapshot(&[record]).unwrap())
            .await
            .unwrap();

        let stats = messenger.sweep_now().await.unwrap();
        assert_eq!(stats.expired, 1);

        let payload = store.fetch_latest(&channel).await.unwrap().unwrap();
        assert!(decode_snapshot(&payload).unwrap().is_empty());
    }
}
