//! The external log store seam.
//!
//! The store is deliberately dumb: an opaque payload per channel reference,
//! replaced wholesale on every publish. Batching, mutation and expiry all
//! live above this trait. Implementations may be arbitrarily remote, so
//! every operation is async and fallible.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{HavenError, HavenResult};
use crate::types::ChannelId;

/// Channel reference to latest published snapshot.
const CHANNELS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");

/// The two-operation store contract, plus channel discovery.
///
/// `publish` replaces whatever was there before; there is no
/// compare-and-swap, so concurrent writers race and the last one wins.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Replace the channel's payload. Acknowledged or failed, never partial.
    async fn publish(&self, channel: &ChannelId, payload: Vec<u8>) -> HavenResult<()>;

    /// The latest published payload, or `None` for an unwritten channel.
    async fn fetch_latest(&self, channel: &ChannelId) -> HavenResult<Option<Vec<u8>>>;

    /// Every channel this store has a payload for.
    async fn known_channels(&self) -> HavenResult<Vec<ChannelId>>;
}

/// In-memory store for tests and benches.
///
/// Supports injecting publish failures to exercise error paths.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    snapshots: Arc<Mutex<BTreeMap<ChannelId, Vec<u8>>>>,
    fail_count: Arc<AtomicUsize>,
    publishes: Arc<AtomicUsize>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with
    /// [`HavenError::LogStoreUnavailable`].
    pub fn fail_publishes(&self, count: usize) {
        self.fail_count.store(count, Ordering::SeqCst);
    }

    /// Number of channels currently holding a payload.
    pub fn channel_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Total successful publishes across all channels.
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn publish(&self, channel: &ChannelId, payload: Vec<u8>) -> HavenResult<()> {
        if self.fail_count.load(Ordering::SeqCst) > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            return Err(HavenError::LogStoreUnavailable(
                "Injected publish failure".to_string(),
            ));
        }

        self.snapshots.lock().insert(channel.clone(), payload);
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_latest(&self, channel: &ChannelId) -> HavenResult<Option<Vec<u8>>> {
        Ok(self.snapshots.lock().get(channel).cloned())
    }

    async fn known_channels(&self) -> HavenResult<Vec<ChannelId>> {
        Ok(self.snapshots.lock().keys().cloned().collect())
    }
}

/// Redb-backed store: one table mapping channel references to snapshots.
///
/// Stands in for the remote log service in the CLI and in integration
/// setups where persistence across processes matters.
pub struct RedbLogStore {
    db: Arc<RwLock<Database>>,
}

impl RedbLogStore {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the file cannot be created or opened.
    pub fn open(path: impl AsRef<Path>) -> HavenResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        // Ensure the table exists so first reads see an empty store
        // instead of a missing table.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CHANNELS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }
}

#[async_trait]
impl LogStore for RedbLogStore {
    async fn publish(&self, channel: &ChannelId, payload: Vec<u8>) -> HavenResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHANNELS_TABLE)?;
            table.insert(channel.as_str(), payload.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn fetch_latest(&self, channel: &ChannelId) -> HavenResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHANNELS_TABLE)?;

        match table.get(channel.as_str())? {
            Some(value) => Ok(Some(value.value().to_vec())),
            None => Ok(None),
        }
    }

    async fn known_channels(&self) -> HavenResult<Vec<ChannelId>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHANNELS_TABLE)?;

        let mut channels = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            channels.push(ChannelId::new(key.value()));
        }
        Ok(channels)
    }
}
