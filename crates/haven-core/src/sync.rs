//! Whole-log synchronization against the store.
//!
//! Every write is a fetch-latest, a local change, and a wholesale
//! republish of the channel's record list. The store offers no
//! compare-and-swap, so two writers interleaving here race and the last
//! publish wins; a concurrent writer's changes can be silently dropped.
//! That is the store contract, not a bug this layer tries to fix.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::crypto::content_hash;
use crate::error::{HavenError, HavenResult};
use crate::message::MessageRecord;
use crate::store::LogStore;
use crate::types::{ChannelId, MessageId};

/// Encode a channel's record list into its published wire form.
pub fn encode_snapshot(records: &[MessageRecord]) -> HavenResult<Vec<u8>> {
    postcard::to_stdvec(records)
        .map_err(|e| HavenError::Serialization(format!("Failed to encode snapshot: {}", e)))
}

/// Decode a published payload back into records.
///
/// # Errors
///
/// Returns [`HavenError::Serialization`] for corrupt payloads, including
/// records carrying an unknown message kind.
pub fn decode_snapshot(payload: &[u8]) -> HavenResult<Vec<MessageRecord>> {
    postcard::from_bytes(payload)
        .map_err(|e| HavenError::Serialization(format!("Failed to decode snapshot: {}", e)))
}

/// Fetch / mutate / republish driver for one store.
pub struct LogSynchronizer<S: LogStore> {
    store: Arc<S>,
    expiry_window_ms: i64,
}

impl<S: LogStore> LogSynchronizer<S> {
    pub fn new(store: Arc<S>, expiry_window_ms: i64) -> Self {
        Self {
            store,
            expiry_window_ms,
        }
    }

    /// The expiry window applied to reads, in milliseconds.
    pub fn expiry_window_ms(&self) -> i64 {
        self.expiry_window_ms
    }

    /// Append a batch of records to the channel log, preserving order.
    ///
    /// Returns the number of records appended. An empty batch publishes
    /// nothing.
    pub async fn append_batch(
        &self,
        channel: &ChannelId,
        records: Vec<MessageRecord>,
    ) -> HavenResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut all = self.load(channel).await?;
        let appended = records.len();
        all.extend(records);

        self.republish(channel, &all).await?;
        debug!(
            channel = %channel,
            appended,
            total = all.len(),
            "Appended batch to channel log"
        );
        Ok(appended)
    }

    /// Locate `id` in the channel log and apply `mutate` to it.
    ///
    /// The log is republished only if the closure reports a change.
    /// Returns whether anything changed; an absent id is a silent no-op.
    pub async fn apply_mutation<F>(
        &self,
        channel: &ChannelId,
        id: &MessageId,
        mutate: F,
    ) -> HavenResult<bool>
    where
        F: FnOnce(&mut MessageRecord) -> bool,
    {
        let mut records = self.load(channel).await?;

        let Some(record) = records.iter_mut().find(|r| &r.id == id) else {
            debug!(channel = %channel, message_id = %id, "Mutation target not in channel log");
            return Ok(false);
        };

        if !mutate(record) {
            return Ok(false);
        }

        self.republish(channel, &records).await?;
        Ok(true)
    }

    /// The channel's records with expired entries filtered out.
    ///
    /// Records past their expiry window are invisible to readers even
    /// before a reaper sweep removes them from the store.
    pub async fn read(&self, channel: &ChannelId) -> HavenResult<Vec<MessageRecord>> {
        let records = self.load(channel).await?;
        let now = Utc::now().timestamp_millis();
        Ok(records.into_iter().filter(|r| !r.is_expired(now)).collect())
    }

    async fn load(&self, channel: &ChannelId) -> HavenResult<Vec<MessageRecord>> {
        match self.store.fetch_latest(channel).await? {
            Some(payload) => decode_snapshot(&payload),
            None => Ok(Vec::new()),
        }
    }

    async fn republish(&self, channel: &ChannelId, records: &[MessageRecord]) -> HavenResult<()> {
        let payload = encode_snapshot(records)?;
        debug!(
            channel = %channel,
            records = records.len(),
            snapshot_hash = %hex::encode(&content_hash(&payload)[..8]),
            "Publishing channel snapshot"
        );
        self.store.publish(channel, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SealedBody;
    use crate::identity::IdentityKeys;
    use crate::message::{MessageContent, MessageKind};
    use crate::store::MemoryLogStore;

    const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn test_record(sender: &IdentityKeys, text: &str) -> MessageRecord {
        let body =
            SealedBody::seal(text.as_bytes(), &[sender.public_bundle()], sender).unwrap();
        MessageRecord::new(sender.user_id(), MessageKind::Text, body, WEEK_MS, None, None)
    }

    fn shown_text(rec: &MessageRecord, reader: &IdentityKeys) -> String {
        match rec
            .to_channel_message(reader, Some(&reader.signing_public()))
            .content
        {
            MessageContent::Text(text) => text,
            other => panic!("expected text content, got {:?}", other),
        }
    }

    fn synchronizer(store: &MemoryLogStore) -> LogSynchronizer<MemoryLogStore> {
        LogSynchronizer::new(Arc::new(store.clone()), WEEK_MS)
    }

    #[tokio::test]
    async fn test_append_batch_to_empty_channel() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");

        let appended = sync
            .append_batch(&channel, vec![test_record(&alice, "one"), test_record(&alice, "two")])
            .await
            .unwrap();

        assert_eq!(appended, 2);
        let records = sync.read(&channel).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(shown_text(&records[0], &alice), "one");
        assert_eq!(shown_text(&records[1], &alice), "two");
    }

    #[tokio::test]
    async fn test_append_batch_preserves_order_across_batches() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");

        sync.append_batch(&channel, vec![test_record(&alice, "first")])
            .await
            .unwrap();
        sync.append_batch(&channel, vec![test_record(&alice, "second"), test_record(&alice, "third")])
            .await
            .unwrap();

        let records = sync.read(&channel).await.unwrap();
        let texts: Vec<String> = records.iter().map(|r| shown_text(r, &alice)).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_append_empty_batch_publishes_nothing() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);

        let appended = sync
            .append_batch(&ChannelId::new("general"), vec![])
            .await
            .unwrap();

        assert_eq!(appended, 0);
        assert_eq!(store.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_mutation_republishes_change() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");

        let record = test_record(&alice, "reactable");
        let id = record.id;
        sync.append_batch(&channel, vec![record]).await.unwrap();

        let changed = sync
            .apply_mutation(&channel, &id, |rec| {
                rec.apply_reaction("👍", alice.user_id())
            })
            .await
            .unwrap();

        assert!(changed);
        let records = sync.read(&channel).await.unwrap();
        assert_eq!(records[0].reactions["👍"].len(), 1);
    }

    #[tokio::test]
    async fn test_apply_mutation_missing_id_is_silent_noop() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");

        sync.append_batch(&channel, vec![test_record(&alice, "only one")])
            .await
            .unwrap();
        let before = store.fetch_latest(&channel).await.unwrap();

        let changed = sync
            .apply_mutation(&channel, &MessageId::new(), |rec| {
                rec.apply_reaction("👍", alice.user_id())
            })
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(store.fetch_latest(&channel).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_apply_mutation_unchanged_skips_republish() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);
        let alice = IdentityKeys::generate();
        let mallory = IdentityKeys::generate();
        let channel = ChannelId::new("general");

        let record = test_record(&alice, "protected");
        let id = record.id;
        sync.append_batch(&channel, vec![record]).await.unwrap();

        // Any publish attempt would fail; a rule-blocked mutation must
        // never reach the store.
        store.fail_publishes(1);
        let changed = sync
            .apply_mutation(&channel, &id, |rec| {
                rec.apply_delete(&mallory.user_id(), true)
            })
            .await
            .unwrap();

        assert!(!changed);
        store.fail_publishes(0);
    }

    #[tokio::test]
    async fn test_read_filters_expired_records() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");

        let fresh = test_record(&alice, "fresh");
        let mut stale = test_record(&alice, "stale");
        // Sent eight days ago with a seven day window.
        stale.timestamp -= 8 * DAY_MS;
        stale.expires_at = stale.timestamp + WEEK_MS;

        sync.append_batch(&channel, vec![stale, fresh]).await.unwrap();

        let records = sync.read(&channel).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(shown_text(&records[0], &alice), "fresh");

        // The stale record still sits in the store until a sweep.
        let raw = store.fetch_latest(&channel).await.unwrap().unwrap();
        assert_eq!(decode_snapshot(&raw).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_unwritten_channel_is_empty() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);

        let records = sync.read(&ChannelId::new("nowhere")).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_serialization_error() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);
        let channel = ChannelId::new("general");

        store
            .publish(&channel, b"definitely not postcard".to_vec())
            .await
            .unwrap();

        assert!(matches!(
            sync.read(&channel).await,
            Err(HavenError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_from_append() {
        let store = MemoryLogStore::new();
        let sync = synchronizer(&store);
        let alice = IdentityKeys::generate();

        store.fail_publishes(1);
        let result = sync
            .append_batch(&ChannelId::new("general"), vec![test_record(&alice, "lost")])
            .await;

        assert!(matches!(result, Err(HavenError::LogStoreUnavailable(_))));
    }
}
