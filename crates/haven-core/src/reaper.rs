//! Disappearing-message enforcement.
//!
//! A periodic sweep walks every known channel, drops records whose
//! expiry has passed, and republishes the trimmed list. Channels whose
//! list did not shrink are left untouched. One misbehaving channel
//! never stops the sweep; its failure is counted and the sweep moves on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::MessengerEvent;
use crate::error::HavenResult;
use crate::store::LogStore;
use crate::sync::{decode_snapshot, encode_snapshot};

/// Outcome of one full sweep across all known channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Channels examined.
    pub channels: usize,
    /// Channels republished with a shorter list.
    pub swept: usize,
    /// Records dropped across all channels.
    pub expired: usize,
    /// Channels skipped because their payload could not be read,
    /// decoded, or republished.
    pub failures: usize,
}

/// Background reaper for expired records.
pub struct ExpiryReaper<S: LogStore> {
    store: Arc<S>,
    sweep_interval: Duration,
    events: broadcast::Sender<MessengerEvent>,
}

impl<S: LogStore + 'static> ExpiryReaper<S> {
    pub fn new(
        store: Arc<S>,
        sweep_interval: Duration,
        events: broadcast::Sender<MessengerEvent>,
    ) -> Self {
        Self {
            store,
            sweep_interval,
            events,
        }
    }

    /// Sweep every known channel once.
    ///
    /// Per-channel failures are logged and counted in the returned stats;
    /// only a failure to list the channels themselves is an error.
    pub async fn sweep(&self) -> HavenResult<SweepStats> {
        let now = Utc::now().timestamp_millis();
        let mut stats = SweepStats::default();

        for channel in self.store.known_channels().await? {
            stats.channels += 1;

            let payload = match self.store.fetch_latest(&channel).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Sweep could not fetch channel");
                    stats.failures += 1;
                    continue;
                }
            };

            let mut records = match decode_snapshot(&payload) {
                Ok(records) => records,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Sweep could not decode channel");
                    stats.failures += 1;
                    continue;
                }
            };

            let before = records.len();
            records.retain(|record| !record.is_expired(now));
            let dropped = before - records.len();
            if dropped == 0 {
                continue;
            }

            let encoded = match encode_snapshot(&records) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Sweep could not re-encode channel");
                    stats.failures += 1;
                    continue;
                }
            };
            if let Err(e) = self.store.publish(&channel, encoded).await {
                warn!(channel = %channel, error = %e, "Sweep could not republish channel");
                stats.failures += 1;
                continue;
            }

            debug!(channel = %channel, dropped, remaining = records.len(), "Swept expired records");
            stats.swept += 1;
            stats.expired += dropped;
        }

        if stats.expired > 0 || stats.failures > 0 {
            info!(
                channels = stats.channels,
                swept = stats.swept,
                expired = stats.expired,
                failures = stats.failures,
                "Expiry sweep complete"
            );
        } else {
            debug!(channels = stats.channels, "Expiry sweep found nothing to drop");
        }

        let _ = self.events.send(MessengerEvent::SweepCompleted { stats });
        Ok(stats)
    }

    /// Run sweeps forever at the configured interval.
    ///
    /// The first sweep fires immediately. The returned handle can be
    /// aborted to stop the loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep().await {
                    warn!(error = %e, "Expiry sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SealedBody;
    use crate::identity::IdentityKeys;
    use crate::message::{MessageKind, MessageRecord};
    use crate::store::MemoryLogStore;
    use crate::types::ChannelId;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    const WEEK_MS: i64 = 7 * DAY_MS;

    fn record_aged(sender: &IdentityKeys, text: &str, age_ms: i64) -> MessageRecord {
        let body =
            SealedBody::seal(text.as_bytes(), &[sender.public_bundle()], sender).unwrap();
        let mut record =
            MessageRecord::new(sender.user_id(), MessageKind::Text, body, WEEK_MS, None, None);
        record.timestamp -= age_ms;
        record.expires_at -= age_ms;
        record
    }

    async fn seed(store: &MemoryLogStore, channel: &ChannelId, records: &[MessageRecord]) {
        store
            .publish(channel, encode_snapshot(records).unwrap())
            .await
            .unwrap();
    }

    async fn stored_len(store: &MemoryLogStore, channel: &ChannelId) -> usize {
        let payload = store.fetch_latest(channel).await.unwrap().unwrap();
        decode_snapshot(&payload).unwrap().len()
    }

    fn test_reaper(store: &MemoryLogStore) -> ExpiryReaper<MemoryLogStore> {
        let (events, _) = broadcast::channel(16);
        ExpiryReaper::new(Arc::new(store.clone()), Duration::from_secs(60), events)
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_records_alone() {
        let store = MemoryLogStore::new();
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");
        seed(
            &store,
            &channel,
            &[record_aged(&alice, "new", 0), record_aged(&alice, "day old", DAY_MS)],
        )
        .await;
        let publishes_before = store.publish_count();

        let reaper = test_reaper(&store);
        let stats = reaper.sweep().await.unwrap();

        assert_eq!(stats.channels, 1);
        assert_eq!(stats.swept, 0);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.failures, 0);
        // Nothing shrank, so nothing was republished.
        assert_eq!(store.publish_count(), publishes_before);
        assert_eq!(stored_len(&store, &channel).await, 2);
    }

    #[tokio::test]
    async fn test_sweep_drops_only_expired_records() {
        let store = MemoryLogStore::new();
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");
        let keeper = record_aged(&alice, "six days old", 6 * DAY_MS);
        let keeper_id = keeper.id;
        seed(
            &store,
            &channel,
            &[record_aged(&alice, "eight days old", 8 * DAY_MS), keeper],
        )
        .await;

        let reaper = test_reaper(&store);
        let stats = reaper.sweep().await.unwrap();

        assert_eq!(stats.swept, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.failures, 0);

        let payload = store.fetch_latest(&channel).await.unwrap().unwrap();
        let remaining = decode_snapshot(&payload).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, keeper_id);
    }

    #[tokio::test]
    async fn test_sweep_can_empty_a_channel() {
        let store = MemoryLogStore::new();
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("ghost-town");
        seed(&store, &channel, &[record_aged(&alice, "stale", 9 * DAY_MS)]).await;

        let reaper = test_reaper(&store);
        let stats = reaper.sweep().await.unwrap();

        assert_eq!(stats.expired, 1);
        assert_eq!(stored_len(&store, &channel).await, 0);
    }

    #[tokio::test]
    async fn test_sweep_isolates_corrupt_channel() {
        let store = MemoryLogStore::new();
        let alice = IdentityKeys::generate();
        let broken = ChannelId::new("broken");
        let healthy = ChannelId::new("healthy");

        store
            .publish(&broken, vec![0xFF, 0x00, 0xFF, 0x00, 0xFF])
            .await
            .unwrap();
        seed(&store, &healthy, &[record_aged(&alice, "old", 8 * DAY_MS)]).await;

        let reaper = test_reaper(&store);
        let stats = reaper.sweep().await.unwrap();

        // The corrupt channel is counted and skipped; the healthy one still sweeps.
        assert_eq!(stats.channels, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.swept, 1);
        assert_eq!(stored_len(&store, &healthy).await, 0);
    }

    #[tokio::test]
    async fn test_sweep_counts_republish_failure() {
        let store = MemoryLogStore::new();
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");
        seed(&store, &channel, &[record_aged(&alice, "old", 8 * DAY_MS)]).await;

        store.fail_publishes(1);
        let reaper = test_reaper(&store);
        let stats = reaper.sweep().await.unwrap();

        assert_eq!(stats.failures, 1);
        assert_eq!(stats.swept, 0);
        // The old list survives; the next sweep gets another chance.
        assert_eq!(stored_len(&store, &channel).await, 1);

        let stats = reaper.sweep().await.unwrap();
        assert_eq!(stats.swept, 1);
        assert_eq!(stored_len(&store, &channel).await, 0);
    }

    #[tokio::test]
    async fn test_sweep_emits_stats_event() {
        let store = MemoryLogStore::new();
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");
        seed(&store, &channel, &[record_aged(&alice, "old", 8 * DAY_MS)]).await;

        let (events, mut rx) = broadcast::channel(16);
        let reaper = ExpiryReaper::new(Arc::new(store.clone()), Duration::from_secs(60), events);
        let stats = reaper.sweep().await.unwrap();

        match rx.try_recv().unwrap() {
            MessengerEvent::SweepCompleted { stats: emitted } => assert_eq!(emitted, stats),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_periodic_sweeps() {
        let store = MemoryLogStore::new();
        let alice = IdentityKeys::generate();
        let channel = ChannelId::new("general");
        seed(&store, &channel, &[record_aged(&alice, "old", 8 * DAY_MS)]).await;

        let (events, _) = broadcast::channel(16);
        let reaper = Arc::new(ExpiryReaper::new(
            Arc::new(store.clone()),
            Duration::from_secs(3600),
            events,
        ));
        let handle = Arc::clone(&reaper).start();

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stored_len(&store, &channel).await, 0);

        // A record expiring later is caught by a later tick.
        seed(&store, &channel, &[record_aged(&alice, "also old", 8 * DAY_MS)]).await;
        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(stored_len(&store, &channel).await, 0);

        handle.abort();
    }
}
