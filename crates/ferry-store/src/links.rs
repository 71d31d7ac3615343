use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::locks::{KeyLocks, Keyspace};
use crate::store::{Bucket, Store};

/// One persisted pairing between a chat on the bot platform and a room on
/// the federated platform. The record key (identifier) lives outside the
/// struct — it is the primary-table key.
///
/// Once `chat_id != 0 && room_id != ""` the record is complete and those two
/// fields never change again. The profile fields stay mutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomLink {
    pub chat_id: i64,
    pub room_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: String,
    #[serde(default)]
    pub last_profile_sync: Option<DateTime<Utc>>,
}

impl RoomLink {
    pub fn is_complete(&self) -> bool {
        self.chat_id != 0 && !self.room_id.is_empty()
    }

    /// Profile data older than 30 minutes is refreshed on the next relayed
    /// message.
    pub fn profile_refresh_due(&self) -> bool {
        match self.last_profile_sync {
            Some(at) => Utc::now() - at > Duration::minutes(30),
            None => true,
        }
    }
}

/// 8-byte little-endian bucket key for a chat id.
pub fn chat_key(chat_id: i64) -> [u8; 8] {
    chat_id.to_le_bytes()
}

/// Primary record table plus its two derived lookup indices.
pub struct LinkTable {
    store: Arc<Store>,
    locks: Arc<KeyLocks>,
    /// Width of freshly drawn identifiers. Grows by one byte on collision
    /// and never shrinks; an occasional unnecessary bump is tolerated.
    id_width: AtomicUsize,
}

impl LinkTable {
    /// Open the table over an already-open store. If either secondary index
    /// bucket is missing, both are dropped and re-derived from the primary
    /// table — the only supported repair path for index corruption.
    pub fn open(store: Arc<Store>, locks: Arc<KeyLocks>) -> Result<Self, StoreError> {
        let table = Self {
            store,
            locks,
            id_width: AtomicUsize::new(1),
        };

        if !table.store.exists(Bucket::ChatIndex)? || !table.store.exists(Bucket::RoomIndex)? {
            let rebuilt = table.rebuild_indexes()?;
            info!(records = rebuilt, "secondary indices rebuilt from primary table");
        }

        Ok(table)
    }

    /// Re-derive both secondary indices from one ordered scan of the primary
    /// table, atomically.
    pub fn rebuild_indexes(&self) -> Result<usize, StoreError> {
        self.store.rebuild_indexes(|_, raw| {
            let link: RoomLink = serde_json::from_slice(raw)?;
            Ok((chat_key(link.chat_id).to_vec(), link.room_id.into_bytes()))
        })
    }

    pub fn index_by_chat(&self, chat_id: i64) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(Bucket::ChatIndex, &chat_key(chat_id))
    }

    pub fn index_by_room(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(Bucket::RoomIndex, room_id.as_bytes())
    }

    pub fn link_by_id(&self, id: &[u8]) -> Result<Option<RoomLink>, StoreError> {
        match self.store.get(Bucket::Links, id)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_link(&self, id: &[u8], link: &RoomLink) -> Result<(), StoreError> {
        self.store.put(Bucket::Links, id, &serde_json::to_vec(link)?)
    }

    pub fn put_chat_index(&self, chat_id: i64, id: &[u8]) -> Result<(), StoreError> {
        self.store.put(Bucket::ChatIndex, &chat_key(chat_id), id)
    }

    pub fn put_room_index(&self, room_id: &str, id: &[u8]) -> Result<(), StoreError> {
        self.store.put(Bucket::RoomIndex, room_id.as_bytes(), id)
    }

    /// Draw an unused identifier and return it together with its held write
    /// lock. Holding the lock before the existence check is what stops two
    /// callers from claiming the same free key. On collision the draw width
    /// grows by one byte, process-wide.
    pub async fn allocate_id(
        &self,
    ) -> Result<(Vec<u8>, OwnedRwLockWriteGuard<()>), StoreError> {
        loop {
            let width = self.id_width.load(Ordering::Relaxed);
            let mut id = vec![0u8; width];
            rand::rng().fill_bytes(&mut id);

            let guard = self.locks.handle(Keyspace::Link, &id).write_owned().await;
            if self.store.get(Bucket::Links, &id)?.is_none() {
                return Ok((id, guard));
            }
            drop(guard);

            debug!(id = %hex::encode(&id), "identifier collision, growing width");
            self.id_width.fetch_max(width + 1, Ordering::Relaxed);
        }
    }

    /// Refresh the mutable profile fields under the identifier's write lock.
    /// The identity fields are left untouched. A missing record is a no-op.
    pub async fn set_profile(
        &self,
        id: &[u8],
        display_name: &str,
        avatar_ref: Option<&str>,
    ) -> Result<(), StoreError> {
        let _guard = self.locks.handle(Keyspace::Link, id).write_owned().await;
        if let Some(mut link) = self.link_by_id(id)? {
            link.display_name = display_name.to_string();
            if let Some(avatar) = avatar_ref {
                link.avatar_ref = avatar.to_string();
            }
            link.last_profile_sync = Some(Utc::now());
            self.put_link(id, &link)?;
        }
        Ok(())
    }

    pub fn locks(&self) -> &Arc<KeyLocks> {
        &self.locks
    }
}
