//! Direct adapter contracts: the atomic primitives each backend provides.
//!
//! One trait per coordination primitive. Every operation is single-key
//! atomic -- that atomicity is the adapter's contract, and the primitive
//! layer above is free to assume it. Adapters that can only offer CRUD rows
//! implement the database flavor in [`super::database`] instead and are
//! normalized through a bridge.
//!
//! All traits are used as `Arc<dyn _>` and return `anyhow::Result`; the
//! primitive layer wraps faults into its typed error taxonomy.

use async_trait::async_trait;

use super::record::{LockRecord, SemaphoreRecord, SharedLockState};
use crate::time::TimeSpan;

/// Atomic storage primitive for the exclusive lock.
#[async_trait]
pub trait LockAdapter: Send + Sync {
    /// Atomically sets the record iff no unexpired record exists OR the
    /// existing record's owner equals `owner`. Returns whether the caller
    /// now owns the lock.
    ///
    /// Re-acquire by the same owner is a successful no-op: the expiration
    /// is NOT updated. Only [`refresh`](LockAdapter::refresh) moves it.
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool>;

    /// Atomically removes the record iff present, unexpired, and owned by
    /// `owner`. Returns whether a removal happened.
    async fn release(&self, key: &str, owner: &str) -> anyhow::Result<bool>;

    /// Unconditionally removes any unexpired record. Returns whether
    /// something was removed.
    async fn force_release(&self, key: &str) -> anyhow::Result<bool>;

    /// Atomically sets a new expiration iff the record is present,
    /// unexpired, owned by `owner`, and its current expiration is non-null.
    /// An unexpireable lock cannot be refreshed.
    async fn refresh(&self, key: &str, owner: &str, ttl: TimeSpan) -> anyhow::Result<bool>;

    /// Current record, or `None` if absent or expired.
    async fn get_state(&self, key: &str) -> anyhow::Result<Option<LockRecord>>;
}

/// Parameters for a semaphore slot acquisition.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreAcquire<'a> {
    pub key: &'a str,
    pub slot_id: &'a str,
    /// Requested capacity. Ignored while any unexpired slot exists; the
    /// limit recorded on first insert is the one enforced until the record
    /// drains.
    pub limit: u32,
    pub ttl: Option<TimeSpan>,
}

/// Atomic storage primitive for the counting semaphore.
#[async_trait]
pub trait SemaphoreAdapter: Send + Sync {
    /// Atomically: prune expired slots; if the slot is already present,
    /// succeed without updating its TTL; else insert iff capacity remains.
    /// Returns whether the slot is now held.
    async fn acquire(&self, request: SemaphoreAcquire<'_>) -> anyhow::Result<bool>;

    /// Removes the slot iff present and unexpired; deletes the record when
    /// the last slot leaves. Must not remove other slots.
    async fn release(&self, key: &str, slot_id: &str) -> anyhow::Result<bool>;

    /// Removes the whole record. Returns whether it held at least one
    /// unexpired slot.
    async fn force_release_all(&self, key: &str) -> anyhow::Result<bool>;

    /// Updates the slot's expiration iff present, unexpired, and its
    /// current expiration is non-null.
    async fn refresh(&self, key: &str, slot_id: &str, ttl: TimeSpan) -> anyhow::Result<bool>;

    /// Current record with only live slots, or `None` if absent or fully
    /// expired.
    async fn get_state(&self, key: &str) -> anyhow::Result<Option<SemaphoreRecord>>;
}

/// Parameters for a reader-slot acquisition on a shared lock.
#[derive(Debug, Clone, Copy)]
pub struct ReaderAcquire<'a> {
    pub key: &'a str,
    pub lock_id: &'a str,
    /// Requested reader capacity; frozen like the semaphore limit.
    pub limit: u32,
    pub ttl: Option<TimeSpan>,
}

/// Atomic storage primitive for the shared (reader/writer) lock.
///
/// Union of the lock and semaphore contracts plus the disjointness rule:
/// any writer operation fails (returns false, state untouched) while a
/// reader record exists, and any reader operation fails while a writer
/// record exists. Mode transitions happen only through a full release of
/// the active side (lazy expiry of the last entry counts).
#[async_trait]
pub trait SharedLockAdapter: Send + Sync {
    /// Writer-mode acquire: succeeds iff the record is absent-or-expired
    /// OR already writer-held by the same owner (idempotent, no TTL
    /// update). Fails without mutating while any reader slot is present.
    async fn acquire_writer(
        &self,
        key: &str,
        owner: &str,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool>;

    /// Writer-mode release; false (and no-op) on a reader-held record.
    async fn release_writer(&self, key: &str, owner: &str) -> anyhow::Result<bool>;

    /// Writer-mode refresh; same conditions as [`LockAdapter::refresh`].
    async fn refresh_writer(&self, key: &str, owner: &str, ttl: TimeSpan)
        -> anyhow::Result<bool>;

    /// Removes the writer regardless of owner; false (and no-op) on a
    /// reader-held record.
    async fn force_release_writer(&self, key: &str) -> anyhow::Result<bool>;

    /// Reader-mode acquire: succeeds iff absent-or-expired (creates the
    /// reader record), reader-held with capacity, or reader-held by the
    /// same `lock_id` (idempotent). Fails without mutating while a writer
    /// is present.
    async fn acquire_reader(&self, request: ReaderAcquire<'_>) -> anyhow::Result<bool>;

    /// Reader-mode release; false (and no-op) on a writer-held record.
    async fn release_reader(&self, key: &str, lock_id: &str) -> anyhow::Result<bool>;

    /// Reader-mode refresh; same conditions as [`SemaphoreAdapter::refresh`].
    async fn refresh_reader(
        &self,
        key: &str,
        lock_id: &str,
        ttl: TimeSpan,
    ) -> anyhow::Result<bool>;

    /// Removes all reader slots; false (and no-op) on a writer-held record.
    async fn force_release_all_readers(&self, key: &str) -> anyhow::Result<bool>;

    /// Wipes whichever mode currently holds the record.
    async fn force_release(&self, key: &str) -> anyhow::Result<bool>;

    /// Snapshot with the disjointness invariant: at most one side present,
    /// expired sides reported as absent.
    async fn get_state(&self, key: &str) -> anyhow::Result<SharedLockState>;
}

/// Outcome of an atomic cache increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// The stored number was updated in place; expiration unchanged.
    Incremented,
    /// No live entry exists for the key.
    Missing,
    /// A live entry exists but its value is not numeric.
    NotNumeric,
}

/// Atomic storage primitive for the cache.
///
/// All operations are single-key atomic. `clear` is the one multi-key
/// operation and is expected to be implemented efficiently by the backend.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Live value for the key, or `None` if absent or expired.
    async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;

    /// Inserts iff the key is absent or expired. Returns whether an insert
    /// happened.
    async fn add(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool>;

    /// Replaces the value iff a live entry exists, preserving its
    /// expiration. Returns whether a write happened.
    async fn update(&self, key: &str, value: serde_json::Value) -> anyhow::Result<bool>;

    /// Unconditionally sets value and expiration. Returns whether a live
    /// entry was replaced.
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool>;

    /// Removes the entry. Returns whether a live entry was removed.
    async fn remove(&self, key: &str) -> anyhow::Result<bool>;

    /// Removes and returns the live value, or `None` if absent or expired.
    async fn get_and_remove(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;

    /// Adds `delta` to the stored number in place, preserving the
    /// expiration.
    async fn increment(&self, key: &str, delta: i64) -> anyhow::Result<IncrementOutcome>;

    /// Removes every key under `prefix`. Returns the number of removed
    /// entries (expired entries count; they were still occupying rows).
    async fn clear(&self, prefix: &str) -> anyhow::Result<u64>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Verifies `Arc<dyn LockAdapter>` compiles (object safety).
    #[test]
    fn lock_adapter_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn LockAdapter>) {}
    }

    /// Verifies `Arc<dyn SemaphoreAdapter>` compiles (object safety).
    #[test]
    fn semaphore_adapter_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn SemaphoreAdapter>) {}
    }

    /// Verifies `Arc<dyn SharedLockAdapter>` compiles (object safety).
    #[test]
    fn shared_lock_adapter_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn SharedLockAdapter>) {}
    }

    /// Verifies `Arc<dyn CacheAdapter>` compiles (object safety).
    #[test]
    fn cache_adapter_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn CacheAdapter>) {}
    }
}
