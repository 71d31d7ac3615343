use std::path::Path;
use std::sync::{PoisonError, RwLock};

use redb::{Database, ReadableTable, TableDefinition, TableError};
use tracing::info;

use crate::error::StoreError;

const LINKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("links");
const CHAT_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chat_index");
const ROOM_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("room_index");
const SEEN_EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("seen_events");

/// The named buckets inside the store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Primary table of bridge-pair records, keyed by opaque identifier.
    Links,
    /// chat id (8-byte LE) -> identifier.
    ChatIndex,
    /// room id (UTF-8 bytes) -> identifier.
    RoomIndex,
    /// processed inbound event id -> unix timestamp of processing.
    SeenEvents,
}

impl Bucket {
    const fn def(self) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        match self {
            Bucket::Links => LINKS,
            Bucket::ChatIndex => CHAT_INDEX,
            Bucket::RoomIndex => ROOM_INDEX,
            Bucket::SeenEvents => SEEN_EVENTS,
        }
    }
}

/// Single-file embedded store with named, key-ordered buckets.
///
/// Single-key operations are atomic on their own. Cross-bucket consistency
/// is NOT provided here — the create path in the dispatcher holds explicit
/// key locks across its three bucket writes instead of one cross-bucket
/// transaction.
pub struct Store {
    db: RwLock<Option<Database>>,
}

impl Store {
    /// Open or create the store file. The primary and dedup buckets are
    /// created up front; the index buckets are managed by [`crate::LinkTable`]
    /// so a missing one can be detected and rebuilt.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        {
            txn.open_table(LINKS)?;
            txn.open_table(SEEN_EVENTS)?;
        }
        txn.commit()?;

        info!("store opened at {}", path.display());
        Ok(Self {
            db: RwLock::new(Some(db)),
        })
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T, StoreError>) -> Result<T, StoreError> {
        // A poisoned lock only means a panicking reader; the Option itself
        // stays valid, so recover instead of propagating the poison.
        let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StoreError::Closed),
        }
    }

    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(bucket.def())?;
            Ok(table.get(key)?.map(|v| v.value().to_vec()))
        })
    }

    pub fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(bucket.def())?;
                table.insert(key, value)?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    pub fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(bucket.def())?;
                table.remove(key)?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    pub fn exists(&self, bucket: Bucket) -> Result<bool, StoreError> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            match txn.open_table(bucket.def()) {
                Ok(_) => Ok(true),
                Err(TableError::TableDoesNotExist(_)) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn create(&self, bucket: Bucket) -> Result<(), StoreError> {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            {
                txn.open_table(bucket.def())?;
            }
            txn.commit()?;
            Ok(())
        })
    }

    pub fn drop_bucket(&self, bucket: Bucket) -> Result<(), StoreError> {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            txn.delete_table(bucket.def())?;
            txn.commit()?;
            Ok(())
        })
    }

    /// Ordered full scan of a bucket. Used only for index rebuild and
    /// dedup-retention pruning, never on the hot path.
    pub fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(bucket.def())?;
            let mut entries = Vec::new();
            for item in table.range::<&[u8]>(..)? {
                let (k, v) = item?;
                entries.push((k.value().to_vec(), v.value().to_vec()));
            }
            Ok(entries)
        })
    }

    /// Drop and recreate both secondary index buckets, then re-derive them
    /// from one ordered scan of the primary table. Runs in a single write
    /// transaction, so concurrent readers never observe a partial rebuild.
    ///
    /// `derive` maps a primary entry to its (chat key, room key) pair.
    pub fn rebuild_indexes<F>(&self, derive: F) -> Result<usize, StoreError>
    where
        F: Fn(&[u8], &[u8]) -> Result<(Vec<u8>, Vec<u8>), StoreError>,
    {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            let mut rebuilt = 0;
            {
                txn.delete_table(CHAT_INDEX)?;
                txn.delete_table(ROOM_INDEX)?;
                let links = txn.open_table(LINKS)?;
                let mut by_chat = txn.open_table(CHAT_INDEX)?;
                let mut by_room = txn.open_table(ROOM_INDEX)?;
                for item in links.range::<&[u8]>(..)? {
                    let (id, raw) = item?;
                    let (chat_key, room_key) = derive(id.value(), raw.value())?;
                    by_chat.insert(chat_key.as_slice(), id.value())?;
                    by_room.insert(room_key.as_slice(), id.value())?;
                    rebuilt += 1;
                }
            }
            txn.commit()?;
            Ok(rebuilt)
        })
    }

    /// Delete every entry in `bucket` for which `keep` returns false, in one
    /// transaction. Returns the number of removed entries.
    pub fn retain<F>(&self, bucket: Bucket, keep: F) -> Result<usize, StoreError>
    where
        F: Fn(&[u8], &[u8]) -> bool,
    {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            let removed;
            {
                let mut table = txn.open_table(bucket.def())?;
                let mut stale = Vec::new();
                for item in table.range::<&[u8]>(..)? {
                    let (k, v) = item?;
                    if !keep(k.value(), v.value()) {
                        stale.push(k.value().to_vec());
                    }
                }
                removed = stale.len();
                for key in stale {
                    table.remove(key.as_slice())?;
                }
            }
            txn.commit()?;
            Ok(removed)
        })
    }

    /// Close the store. The first call drops the database handle (committed
    /// transactions are already durable); every later call is a no-op that
    /// returns `false`. Operations after close fail with [`StoreError::Closed`].
    pub fn close(&self) -> bool {
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(db) => {
                drop(db);
                info!("store closed");
                true
            }
            None => false,
        }
    }
}
