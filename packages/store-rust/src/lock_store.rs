//! `redb`-backed [`DatabaseLockAdapter`] implementation.
//!
//! One row per namespaced key, holding a MessagePack-encoded
//! [`LockRecord`]. Each contract call is one transaction; expired rows
//! linger until `update_if_expired` takes them over, exactly the shape the
//! lock bridge expects.

use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable};
use tracing::debug;

use holdfast_core::adapter::{DatabaseLockAdapter, LockRecord};

use crate::LOCKS_TABLE;

/// Lock rows in a shared `redb` database.
pub struct RedbLockStore {
    db: Arc<Database>,
}

impl RedbLockStore {
    /// Creates a store over an already-opened database. The table must
    /// exist; [`crate::RedbCoordinationStore::open`] creates it.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn read_row(&self, key: &str) -> anyhow::Result<Option<LockRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOCKS_TABLE)?;
        match table.get(key)? {
            Some(guard) => Ok(Some(rmp_serde::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DatabaseLockAdapter for RedbLockStore {
    async fn insert(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: Option<u64>,
    ) -> anyhow::Result<bool> {
        let txn = self.db.begin_write()?;
        let inserted = {
            let mut table = txn.open_table(LOCKS_TABLE)?;
            if table.get(key)?.is_some() {
                false
            } else {
                let row = rmp_serde::to_vec(&LockRecord {
                    owner: owner.to_string(),
                    expires_at_ms,
                })?;
                table.insert(key, row.as_slice())?;
                true
            }
        };
        txn.commit()?;
        if inserted {
            debug!(key, owner, "lock row inserted");
        }
        Ok(inserted)
    }

    async fn update_if_expired(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: Option<u64>,
        now_ms: u64,
    ) -> anyhow::Result<u64> {
        let txn = self.db.begin_write()?;
        let affected = {
            let mut table = txn.open_table(LOCKS_TABLE)?;
            let existing: Option<LockRecord> = match table.get(key)? {
                Some(guard) => Some(rmp_serde::from_slice(guard.value())?),
                None => None,
            };
            match existing {
                Some(row) if !row.is_live(now_ms) => {
                    let fresh = rmp_serde::to_vec(&LockRecord {
                        owner: owner.to_string(),
                        expires_at_ms,
                    })?;
                    table.insert(key, fresh.as_slice())?;
                    1
                }
                _ => 0,
            }
        };
        txn.commit()?;
        Ok(affected)
    }

    async fn update_expiration(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: u64,
        now_ms: u64,
    ) -> anyhow::Result<u64> {
        let txn = self.db.begin_write()?;
        let affected = {
            let mut table = txn.open_table(LOCKS_TABLE)?;
            let existing: Option<LockRecord> = match table.get(key)? {
                Some(guard) => Some(rmp_serde::from_slice(guard.value())?),
                None => None,
            };
            match existing {
                Some(row)
                    if row.is_live(now_ms)
                        && row.owner == owner
                        && row.expires_at_ms.is_some() =>
                {
                    let fresh = rmp_serde::to_vec(&LockRecord {
                        owner: row.owner,
                        expires_at_ms: Some(expires_at_ms),
                    })?;
                    table.insert(key, fresh.as_slice())?;
                    1
                }
                _ => 0,
            }
        };
        txn.commit()?;
        Ok(affected)
    }

    async fn remove_if_owner(&self, key: &str, owner: &str, now_ms: u64) -> anyhow::Result<u64> {
        let txn = self.db.begin_write()?;
        let affected = {
            let mut table = txn.open_table(LOCKS_TABLE)?;
            let existing: Option<LockRecord> = match table.get(key)? {
                Some(guard) => Some(rmp_serde::from_slice(guard.value())?),
                None => None,
            };
            match existing {
                Some(row) if row.is_live(now_ms) && row.owner == owner => {
                    table.remove(key)?;
                    1
                }
                _ => 0,
            }
        };
        txn.commit()?;
        Ok(affected)
    }

    async fn remove_if_live(&self, key: &str, now_ms: u64) -> anyhow::Result<u64> {
        let txn = self.db.begin_write()?;
        let affected = {
            let mut table = txn.open_table(LOCKS_TABLE)?;
            let existing: Option<LockRecord> = match table.get(key)? {
                Some(guard) => Some(rmp_serde::from_slice(guard.value())?),
                None => None,
            };
            match existing {
                Some(row) if row.is_live(now_ms) => {
                    table.remove(key)?;
                    1
                }
                _ => 0,
            }
        };
        txn.commit()?;
        Ok(affected)
    }

    async fn find(&self, key: &str) -> anyhow::Result<Option<LockRecord>> {
        self.read_row(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedbCoordinationStore;

    fn store() -> (tempfile::TempDir, Arc<RedbLockStore>) {
        let dir = tempfile::tempdir().unwrap();
        let coordination =
            RedbCoordinationStore::open(dir.path().join("locks.redb")).unwrap();
        (dir, coordination.lock_store())
    }

    #[tokio::test]
    async fn insert_refuses_existing_row_even_expired() {
        let (_dir, store) = store();

        assert!(store.insert("k", "a", Some(500)).await.unwrap());
        assert!(!store.insert("k", "b", None).await.unwrap());

        // Row expired at 500; insert still refuses -- takeover is
        // update_if_expired's job.
        assert!(!store.insert("k", "b", None).await.unwrap());
        assert_eq!(store.update_if_expired("k", "b", None, 1_000).await.unwrap(), 1);
        assert_eq!(store.find("k").await.unwrap().unwrap().owner, "b");
    }

    #[tokio::test]
    async fn update_if_expired_leaves_live_rows_alone() {
        let (_dir, store) = store();
        store.insert("k", "a", Some(2_000)).await.unwrap();

        assert_eq!(store.update_if_expired("k", "b", None, 1_000).await.unwrap(), 0);
        assert_eq!(store.find("k").await.unwrap().unwrap().owner, "a");
    }

    #[tokio::test]
    async fn update_expiration_requires_live_owned_expirable() {
        let (_dir, store) = store();
        store.insert("expirable", "a", Some(2_000)).await.unwrap();
        store.insert("pinned", "a", None).await.unwrap();

        assert_eq!(
            store.update_expiration("expirable", "b", 3_000, 1_000).await.unwrap(),
            0
        );
        assert_eq!(
            store.update_expiration("pinned", "a", 3_000, 1_000).await.unwrap(),
            0,
            "null-expiration rows cannot be refreshed"
        );
        assert_eq!(
            store.update_expiration("expirable", "a", 3_000, 1_000).await.unwrap(),
            1
        );
        assert_eq!(
            store.find("expirable").await.unwrap().unwrap().expires_at_ms,
            Some(3_000)
        );
    }

    #[tokio::test]
    async fn removes_respect_liveness_and_owner() {
        let (_dir, store) = store();
        store.insert("k", "a", Some(2_000)).await.unwrap();

        assert_eq!(store.remove_if_owner("k", "b", 1_000).await.unwrap(), 0);
        assert_eq!(store.remove_if_owner("k", "a", 2_500).await.unwrap(), 0);
        assert_eq!(store.remove_if_owner("k", "a", 1_000).await.unwrap(), 1);
        assert!(store.find("k").await.unwrap().is_none());

        store.insert("k", "a", Some(2_000)).await.unwrap();
        assert_eq!(store.remove_if_live("k", 2_500).await.unwrap(), 0);
        assert_eq!(store.remove_if_live("k", 1_000).await.unwrap(), 1);
    }
}
