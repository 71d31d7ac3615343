use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::StoreError;
use crate::store::{Bucket, Store};

/// Idempotency gate against at-least-once upstream delivery: a persistent
/// set of already-processed inbound event ids.
///
/// Callers check [`seen`](Self::seen) before any side effect and call
/// [`mark_seen`](Self::mark_seen) only after the outbound send succeeded, so
/// a crash between send and mark costs at most one duplicate relay on
/// redelivery, never a lost message.
pub struct SeenEvents {
    store: Arc<Store>,
}

impl SeenEvents {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn seen(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(Bucket::SeenEvents, event_id.as_bytes())?
            .is_some())
    }

    /// Record an event as processed. The value is the unix timestamp of
    /// processing, which is what retention pruning ages on.
    pub fn mark_seen(&self, event_id: &str) -> Result<(), StoreError> {
        let stamp = Utc::now().timestamp().to_le_bytes();
        self.store
            .put(Bucket::SeenEvents, event_id.as_bytes(), &stamp)
    }

    pub fn forget(&self, event_id: &str) -> Result<(), StoreError> {
        self.store.delete(Bucket::SeenEvents, event_id.as_bytes())
    }

    /// Drop entries processed before `cutoff`, in one transaction. Entries
    /// with an unreadable timestamp are kept. Retention is an opt-in policy;
    /// without it the set simply grows by one entry per relayed message.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.store.retain(Bucket::SeenEvents, |_, value| {
            match <[u8; 8]>::try_from(value) {
                Ok(raw) => i64::from_le_bytes(raw) >= cutoff.timestamp(),
                Err(_) => true,
            }
        })?;
        if removed > 0 {
            info!(removed, "pruned processed-event entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_temp() -> (tempfile::TempDir, SeenEvents) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("ferry.db")).unwrap());
        (dir, SeenEvents::new(store))
    }

    #[test]
    fn mark_then_seen() {
        let (_dir, seen) = open_temp();
        assert!(!seen.seen("$ev1").unwrap());
        seen.mark_seen("$ev1").unwrap();
        assert!(seen.seen("$ev1").unwrap());
        assert!(!seen.seen("$ev2").unwrap());
    }

    #[test]
    fn forget_removes_entry() {
        let (_dir, seen) = open_temp();
        seen.mark_seen("$ev1").unwrap();
        seen.forget("$ev1").unwrap();
        assert!(!seen.seen("$ev1").unwrap());
    }

    #[test]
    fn prune_keeps_recent_entries() {
        let (_dir, seen) = open_temp();
        seen.mark_seen("$old").unwrap();
        seen.mark_seen("$new").unwrap();

        // Nothing is older than "one hour ago".
        let removed = seen.prune_older_than(Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(removed, 0);

        // Everything is older than "one hour from now".
        let removed = seen.prune_older_than(Utc::now() + Duration::hours(1)).unwrap();
        assert_eq!(removed, 2);
        assert!(!seen.seen("$old").unwrap());
    }
}
