//! Holdfast store -- persistent single-file backends for the coordination
//! primitives.
//!
//! Implements the database-flavor adapter contracts from `holdfast-core`
//! on top of [`redb`], an embedded ACID key-value store. Rows are
//! MessagePack-encoded records; every contract call runs in its own write
//! (or read) transaction, which supplies the per-call atomicity the
//! bridges assume. `redb` serializes write transactions, so the compound
//! `insert_slot` check-and-insert cannot interleave with another writer.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use holdfast_core::{LockBackend, LockProvider, LockProviderOptions};
//! use holdfast_store::RedbCoordinationStore;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = Arc::new(RedbCoordinationStore::open("coordination.redb")?);
//! let provider = LockProvider::new(
//!     LockBackend::Database(store.lock_store()),
//!     LockProviderOptions::default(),
//! );
//! let _lock = provider.create("nightly-compaction");
//! # Ok(())
//! # }
//! ```

mod lock_store;
mod semaphore_store;

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};

pub use lock_store::RedbLockStore;
pub use semaphore_store::RedbSemaphoreStore;

/// Lock rows, keyed by the namespaced key.
pub(crate) const LOCKS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("holdfast_locks");

/// Semaphore records, keyed by the namespaced key. One row holds the
/// whole slot map; the write transaction stands in for row-level locking.
pub(crate) const SEMAPHORES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("holdfast_semaphores");

/// One database file shared by all coordination stores.
///
/// Opens (or creates) the file and eagerly creates the tables, so read
/// paths never race table creation.
pub struct RedbCoordinationStore {
    db: Arc<Database>,
}

impl RedbCoordinationStore {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(LOCKS_TABLE)?;
            txn.open_table(SEMAPHORES_TABLE)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// The lock-row store over this database.
    #[must_use]
    pub fn lock_store(&self) -> Arc<RedbLockStore> {
        Arc::new(RedbLockStore::new(Arc::clone(&self.db)))
    }

    /// The semaphore-record store over this database.
    #[must_use]
    pub fn semaphore_store(&self) -> Arc<RedbSemaphoreStore> {
        Arc::new(RedbSemaphoreStore::new(Arc::clone(&self.db)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use holdfast_core::adapter::{LockAdapterBridge, SemaphoreAcquire, SemaphoreAdapterBridge};
    use holdfast_core::{
        ClockSource, LockAdapter, LockBackend, LockOptions, LockProvider, LockProviderOptions,
        ManualClock, SemaphoreAdapter, TimeSpan,
    };

    use super::*;

    fn open_store() -> (tempfile::TempDir, RedbCoordinationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbCoordinationStore::open(dir.path().join("coordination.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn reopen_preserves_tables_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordination.redb");
        let clock = Arc::new(ManualClock::new(1_000));

        {
            let store = RedbCoordinationStore::open(&path).unwrap();
            let bridge = LockAdapterBridge::new(
                store.lock_store(),
                Arc::clone(&clock) as Arc<dyn ClockSource>,
            );
            bridge.acquire("k", "a", None).await.unwrap();
        }

        // A fresh process over the same file still sees the lock.
        let store = RedbCoordinationStore::open(&path).unwrap();
        let bridge = LockAdapterBridge::new(
            store.lock_store(),
            Arc::clone(&clock) as Arc<dyn ClockSource>,
        );
        let state = bridge.get_state("k").await.unwrap().unwrap();
        assert_eq!(state.owner, "a");
    }

    #[tokio::test]
    async fn bridged_lock_semantics_end_to_end() {
        let (_dir, store) = open_store();
        let clock = Arc::new(ManualClock::new(1_000));
        let bridge = LockAdapterBridge::new(
            store.lock_store(),
            Arc::clone(&clock) as Arc<dyn ClockSource>,
        );

        assert!(bridge
            .acquire("k", "a", Some(TimeSpan::from_millis(100)))
            .await
            .unwrap());
        assert!(!bridge.acquire("k", "b", None).await.unwrap());
        assert!(bridge.acquire("k", "a", Some(TimeSpan::from_millis(100))).await.unwrap());

        // The re-acquire left the original expiration in place.
        assert_eq!(
            bridge.get_state("k").await.unwrap().unwrap().expires_at_ms,
            Some(1_100)
        );

        clock.advance(TimeSpan::from_millis(101));
        assert!(bridge.get_state("k").await.unwrap().is_none());
        assert!(bridge.acquire("k", "b", None).await.unwrap());

        assert!(!bridge.release("k", "a").await.unwrap());
        assert!(bridge.release("k", "b").await.unwrap());
    }

    #[tokio::test]
    async fn bridged_semaphore_semantics_end_to_end() {
        let (_dir, store) = open_store();
        let clock = Arc::new(ManualClock::new(1_000));
        let bridge = SemaphoreAdapterBridge::new(
            store.semaphore_store(),
            Arc::clone(&clock) as Arc<dyn ClockSource>,
        );
        let request = |slot_id, limit| SemaphoreAcquire {
            key: "pool",
            slot_id,
            limit,
            ttl: None,
        };

        assert!(bridge.acquire(request("s1", 2)).await.unwrap());
        assert!(bridge.acquire(request("s1", 2)).await.unwrap());
        assert!(bridge.acquire(request("s2", 5)).await.unwrap());
        assert!(!bridge.acquire(request("s3", 5)).await.unwrap());

        // The limit recorded first stays in force.
        assert_eq!(bridge.get_state("pool").await.unwrap().unwrap().limit, 2);

        assert!(bridge.release("pool", "s1").await.unwrap());
        assert!(bridge.acquire(request("s3", 2)).await.unwrap());

        assert!(bridge.force_release_all("pool").await.unwrap());
        assert!(bridge.get_state("pool").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_runs_on_the_persistent_backend() {
        let (_dir, store) = open_store();
        let clock = Arc::new(ManualClock::new(1_000));
        let provider = LockProvider::new(
            LockBackend::Database(store.lock_store()),
            LockProviderOptions {
                clock: Arc::clone(&clock) as Arc<dyn ClockSource>,
                ..LockProviderOptions::default()
            },
        );

        let lock_a = provider.create_with(
            "jobs",
            LockOptions {
                owner: Some("a".to_string()),
                ttl: Some(TimeSpan::from_secs(30)),
            },
        );
        let lock_b = provider.create_with(
            "jobs",
            LockOptions {
                owner: Some("b".to_string()),
                ttl: None,
            },
        );

        assert!(lock_a.acquire().await.unwrap());
        assert!(!lock_b.acquire().await.unwrap());
        assert!(lock_a.refresh_with(TimeSpan::from_secs(60)).await.unwrap());
        assert!(lock_a.release().await.unwrap());
        assert!(lock_b.acquire().await.unwrap());
    }
}
