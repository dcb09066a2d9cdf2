//! Persistence seams. `Database` implements all of them; tests may swap any one out.

use crate::error::StoreResult;
use crate::models::{FailedItemInfo, HistoryEntry, QueueItem, QueueKind, QueueNamespace, QueueStats};

/// Result of a capped insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inserted {
    pub id: i64,
    /// Oldest pending items removed to make room
    pub evicted: Vec<i64>,
}

/// Durable FIFO storage for the sync queue. Payloads cross this boundary in clear text.
pub trait QueueStore: Send + Sync {
    /// Insert as pending; when the namespace already holds `capacity` pending items the
    /// oldest ones are deleted in the same transaction.
    fn insert_capped(
        &self,
        kind: QueueKind,
        payload: &str,
        idempotency_key: &str,
        created_at: u64,
        capacity: usize,
    ) -> StoreResult<Inserted>;

    /// Pending items with `id > after_id`, oldest first.
    fn pending_after(
        &self,
        namespace: QueueNamespace,
        after_id: i64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<QueueItem>>;

    /// Pending items, oldest first.
    fn pending(&self, namespace: QueueNamespace, limit: Option<usize>) -> StoreResult<Vec<QueueItem>> {
        self.pending_after(namespace, 0, limit)
    }

    fn count_pending(&self, namespace: QueueNamespace) -> StoreResult<usize>;

    fn delete(&self, id: i64) -> StoreResult<()>;

    fn set_retries(&self, id: i64, retries: u32, error_message: Option<&str>) -> StoreResult<()>;

    /// Keep the item but take it out of the drain (status `failed`).
    fn park(&self, id: i64, retries: u32, error_message: Option<&str>) -> StoreResult<()>;

    fn parked(&self, limit: usize) -> StoreResult<Vec<FailedItemInfo>>;

    /// Move parked items back to pending with zero retries; returns how many.
    fn unpark_all(&self) -> StoreResult<usize>;

    fn stats(&self) -> StoreResult<QueueStats>;

    /// `None` clears every namespace.
    fn clear(&self, namespace: Option<QueueNamespace>) -> StoreResult<()>;
}

/// Cached snapshot of a remote listing.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot {
    pub payload: String,
    pub cached_at: u64,
}

/// Storage behind the read-through cache.
pub trait CacheStore: Send + Sync {
    fn get_snapshot(&self, scope: &str) -> StoreResult<Option<CachedSnapshot>>;

    fn put_snapshot(&self, scope: &str, payload: &str, cached_at: u64) -> StoreResult<()>;

    /// Locally produced history entry for `date` (YYYY-MM-DD); replaces one with the same id.
    fn upsert_local_entry(&self, date: &str, entry: &HistoryEntry) -> StoreResult<()>;

    fn local_entries(&self, date: &str) -> StoreResult<Vec<HistoryEntry>>;

    /// Returns false when no entry with this id exists.
    fn mark_local_synced(&self, id: &str) -> StoreResult<bool>;

    /// Drop synced local entries for `date`; a fresh server listing already contains them.
    fn remove_local_synced(&self, date: &str) -> StoreResult<usize>;

    /// Drop snapshots and local history. The sync queue is not touched.
    fn clear_cache(&self) -> StoreResult<()>;
}

/// Persisted per-sub-task totals so a restart does not lose tracked time.
pub trait TaskTimeStore: Send + Sync {
    fn load_tracked(&self, sub_task_id: &str) -> StoreResult<Option<u64>>;

    fn save_tracked(
        &self,
        task_id: &str,
        sub_task_id: &str,
        tracked_seconds: u64,
        updated_at: u64,
    ) -> StoreResult<()>;
}
