//! `redb`-backed [`DatabaseSemaphoreAdapter`] implementation.
//!
//! One row per namespaced key, holding the MessagePack-encoded
//! [`SemaphoreRecord`] (limit + slot map). The compound
//! `insert_slot` check-and-insert runs as a single read-modify-write
//! inside one write transaction; `redb` serializes writers, so two
//! processes cannot both claim the last slot.

use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable};
use tracing::debug;

use holdfast_core::adapter::{DatabaseSemaphoreAdapter, SemaphoreRecord, SlotInsert};

use crate::SEMAPHORES_TABLE;

/// Semaphore records in a shared `redb` database.
pub struct RedbSemaphoreStore {
    db: Arc<Database>,
}

impl RedbSemaphoreStore {
    /// Creates a store over an already-opened database. The table must
    /// exist; [`crate::RedbCoordinationStore::open`] creates it.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Read-modify-write on one record inside a single write transaction.
    ///
    /// `mutate` returns the outcome plus the record to write back; `None`
    /// deletes the row.
    fn with_record<T>(
        &self,
        key: &str,
        mutate: impl FnOnce(Option<SemaphoreRecord>) -> (T, Option<SemaphoreRecord>),
    ) -> anyhow::Result<T> {
        let txn = self.db.begin_write()?;
        let outcome = {
            let mut table = txn.open_table(SEMAPHORES_TABLE)?;
            let existing: Option<SemaphoreRecord> = match table.get(key)? {
                Some(guard) => Some(rmp_serde::from_slice(guard.value())?),
                None => None,
            };
            let (outcome, updated) = mutate(existing);
            match updated {
                Some(record) => {
                    let encoded = rmp_serde::to_vec(&record)?;
                    table.insert(key, encoded.as_slice())?;
                }
                None => {
                    table.remove(key)?;
                }
            }
            outcome
        };
        txn.commit()?;
        Ok(outcome)
    }
}

#[async_trait]
impl DatabaseSemaphoreAdapter for RedbSemaphoreStore {
    async fn insert_slot(
        &self,
        key: &str,
        slot_id: &str,
        limit: u32,
        expires_at_ms: Option<u64>,
        now_ms: u64,
    ) -> anyhow::Result<SlotInsert> {
        let outcome = self.with_record(key, |existing| {
            let mut record = existing.unwrap_or_else(|| SemaphoreRecord {
                limit,
                slots: std::collections::BTreeMap::new(),
            });
            record.prune_expired(now_ms);
            if record.slots.is_empty() {
                // The limit thaws only when no slot is held.
                record.limit = limit;
            }
            if record.slots.contains_key(slot_id) {
                return (SlotInsert::AlreadyHeld, Some(record));
            }
            if record.live_slot_count(now_ms) < record.limit {
                record.slots.insert(slot_id.to_string(), expires_at_ms);
                (SlotInsert::Inserted, Some(record))
            } else {
                (SlotInsert::LimitReached, Some(record))
            }
        })?;
        if outcome == SlotInsert::Inserted {
            debug!(key, slot_id, "semaphore slot inserted");
        }
        Ok(outcome)
    }

    async fn remove_slot(&self, key: &str, slot_id: &str, now_ms: u64) -> anyhow::Result<u64> {
        self.with_record(key, |existing| {
            let Some(mut record) = existing else {
                return (0, None);
            };
            record.prune_expired(now_ms);
            let removed = u64::from(record.slots.remove(slot_id).is_some());
            if record.slots.is_empty() {
                (removed, None)
            } else {
                (removed, Some(record))
            }
        })
    }

    async fn remove_all_slots(&self, key: &str, now_ms: u64) -> anyhow::Result<u64> {
        self.with_record(key, |existing| match existing {
            Some(record) => (u64::from(record.live_slot_count(now_ms)), None),
            None => (0, None),
        })
    }

    async fn update_slot_expiration(
        &self,
        key: &str,
        slot_id: &str,
        expires_at_ms: u64,
        now_ms: u64,
    ) -> anyhow::Result<u64> {
        self.with_record(key, |existing| {
            let Some(mut record) = existing else {
                return (0, None);
            };
            record.prune_expired(now_ms);
            if record.slots.is_empty() {
                return (0, None);
            }
            let affected = match record.slots.get_mut(slot_id) {
                Some(expires) if expires.is_some() => {
                    *expires = Some(expires_at_ms);
                    1
                }
                _ => 0,
            };
            (affected, Some(record))
        })
    }

    async fn find_slots(&self, key: &str) -> anyhow::Result<Option<SemaphoreRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SEMAPHORES_TABLE)?;
        match table.get(key)? {
            Some(guard) => Ok(Some(rmp_serde::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }
}
