use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

/// The three disjoint keyspaces covered by the lock coordinator. Equal byte
/// values in different keyspaces never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    /// Chat ids on the bot platform (8-byte LE keys).
    Chat,
    /// Opaque record identifiers.
    Link,
    /// Room ids on the federated platform.
    Room,
}

/// Lazily-created per-key read/write locks, cached for the process lifetime.
/// Handles are never persisted.
///
/// Locking rules for callers:
/// 1. Deciding "does this chat already have a record" takes a WRITE lock on
///    the chat key even when the answer turns out to be yes, so two
///    concurrent new-chat callers cannot both observe "absent".
/// 2. Reading an existing record to forward a message takes only a READ lock
///    on the link key (identity fields are immutable once complete).
/// 3. Creating a record acquires Chat-write, then Link-write (via
///    `LinkTable::allocate_id`), then Room-write, and holds all three across
///    all three bucket writes.
///
/// The acquisition order Chat -> Link -> Room is a total order over the
/// keyspaces and is mandatory everywhere multiple locks are taken.
///
/// There is no eviction: the map is bounded by the number of distinct chats,
/// rooms and records the process actually sees, which matches the record
/// table's own growth.
#[derive(Default)]
pub struct KeyLocks {
    map: DashMap<(Keyspace, Vec<u8>), Arc<RwLock<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or lazily create) the lock for one key. Callers await
    /// `read_owned()` / `write_owned()` on the returned handle.
    pub fn handle(&self, space: Keyspace, key: &[u8]) -> Arc<RwLock<()>> {
        self.map
            .entry((space, key.to_vec()))
            .or_default()
            .clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }
}
