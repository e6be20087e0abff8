//! Local device state, persisted with redb.
//!
//! This database holds only what a device must remember between runs:
//! - The device identity (hybrid encryption + signing keys)
//! - The channel directory (which member key bundles belong to which channel)
//!
//! Message content never lives here. All message state is in the external
//! log store; losing this file loses the keys, nothing else.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{HavenError, HavenResult};
use crate::identity::{IdentityKeys, PublicKeys};
use crate::types::ChannelId;

// Table definitions
const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const CHANNELS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");

/// Device state storage backed by redb.
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> HavenResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(CHANNELS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Identity storage key (there's only one identity per device)
    const IDENTITY_KEY: &'static str = "device_identity";

    /// Save the device identity to storage.
    ///
    /// There is only one identity per device, stored with a fixed key;
    /// saving again overwrites it.
    pub fn save_identity(&self, keys: &IdentityKeys) -> HavenResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            let data = keys.to_bytes();
            table.insert(Self::IDENTITY_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the device identity from storage.
    ///
    /// Returns `None` if no identity has been created yet.
    pub fn load_identity(&self) -> HavenResult<Option<IdentityKeys>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(Self::IDENTITY_KEY)? {
            Some(v) => {
                let keys = IdentityKeys::from_bytes(v.value())?;
                Ok(Some(keys))
            }
            None => Ok(None),
        }
    }

    /// Check if an identity exists in storage.
    pub fn has_identity(&self) -> HavenResult<bool> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        Ok(table.get(Self::IDENTITY_KEY)?.is_some())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Channel Directory Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a channel's member key bundles.
    ///
    /// If the channel is already registered, its member list is overwritten.
    pub fn save_channel(&self, channel: &ChannelId, members: &[PublicKeys]) -> HavenResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHANNELS_TABLE)?;
            let data = postcard::to_stdvec(members)
                .map_err(|e| HavenError::Serialization(e.to_string()))?;
            table.insert(channel.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a channel's member key bundles.
    ///
    /// Returns `None` if the channel is not registered on this device.
    pub fn load_channel(&self, channel: &ChannelId) -> HavenResult<Option<Vec<PublicKeys>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHANNELS_TABLE)?;

        match table.get(channel.as_str())? {
            Some(v) => {
                let members: Vec<PublicKeys> = postcard::from_bytes(v.value())
                    .map_err(|e| HavenError::Serialization(e.to_string()))?;
                Ok(Some(members))
            }
            None => Ok(None),
        }
    }

    /// List every channel registered on this device.
    pub fn list_channels(&self) -> HavenResult<Vec<ChannelId>> {
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
