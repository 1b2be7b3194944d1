//! Database-flavor adapter contracts and their normalizing bridges.
//!
//! CRUD-oriented backends (SQL tables, embedded KV stores) cannot always
//! express the compound atomic operations of the direct contracts in one
//! call. The database flavor decomposes each primitive into conditional
//! row operations -- each *individually* atomic on the backend, typically a
//! single statement or one transaction -- and a bridge recomposes the
//! direct semantics from them.
//!
//! The bridge is chosen once, at provider-mint time, through
//! [`LockBackend`] / [`SemaphoreBackend`]; hot paths never type-sniff.

use std::sync::Arc;

use async_trait::async_trait;

use super::contracts::{LockAdapter, SemaphoreAcquire, SemaphoreAdapter};
use super::record::{LockRecord, SemaphoreRecord};
use crate::time::{expiry_from, ClockSource, TimeSpan};

/// CRUD contract for lock rows.
///
/// Each method must be atomic on its own; the bridge composes them and
/// passes `now_ms` in so the backend never needs a clock of its own.
/// Expired rows may linger -- [`insert`](DatabaseLockAdapter::insert)
/// refuses them and
/// [`update_if_expired`](DatabaseLockAdapter::update_if_expired) takes
/// them over.
#[async_trait]
pub trait DatabaseLockAdapter: Send + Sync {
    /// Inserts a row iff no row (live or expired) exists for the key.
    /// Returns whether the insert happened.
    async fn insert(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: Option<u64>,
    ) -> anyhow::Result<bool>;

    /// Takes over an expired row: sets owner and expiration iff a row
    /// exists and its expiration is at or before `now_ms`. Returns rows
    /// affected (0 or 1).
    async fn update_if_expired(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: Option<u64>,
        now_ms: u64,
    ) -> anyhow::Result<u64>;

    /// Sets a new expiration iff the row is live, owned by `owner`, and
    /// its current expiration is non-null. Returns rows affected.
    async fn update_expiration(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: u64,
        now_ms: u64,
    ) -> anyhow::Result<u64>;

    /// Removes the row iff live and owned by `owner`. Returns rows
    /// affected.
    async fn remove_if_owner(&self, key: &str, owner: &str, now_ms: u64) -> anyhow::Result<u64>;

    /// Removes the row iff live, regardless of owner. Returns rows
    /// affected.
    async fn remove_if_live(&self, key: &str, now_ms: u64) -> anyhow::Result<u64>;

    /// Returns the raw row, expired or not.
    async fn find(&self, key: &str) -> anyhow::Result<Option<LockRecord>>;
}

/// Outcome of [`DatabaseSemaphoreAdapter::insert_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotInsert {
    /// A new slot row was inserted.
    Inserted,
    /// The slot was already live; nothing changed (TTL included).
    AlreadyHeld,
    /// Capacity is exhausted under the enforced limit.
    LimitReached,
}

/// CRUD contract for semaphore slot rows.
///
/// [`insert_slot`](DatabaseSemaphoreAdapter::insert_slot) is the one
/// compound call: backends implement it as a single statement or a small
/// transaction with row-level locking, because the capacity check and the
/// insert must not interleave with another writer.
#[async_trait]
pub trait DatabaseSemaphoreAdapter: Send + Sync {
    /// Atomically: drop expired slot rows for the key; succeed idempotently
    /// if `slot_id` is live (no TTL update); otherwise insert iff the live
    /// count is under the enforced limit. The enforced limit is the one
    /// recorded with the existing rows, or `limit` when none remain.
    async fn insert_slot(
        &self,
        key: &str,
        slot_id: &str,
        limit: u32,
        expires_at_ms: Option<u64>,
        now_ms: u64,
    ) -> anyhow::Result<SlotInsert>;

    /// Removes the slot row iff live. Returns rows affected.
    async fn remove_slot(&self, key: &str, slot_id: &str, now_ms: u64) -> anyhow::Result<u64>;

    /// Removes every slot row for the key. Returns the number of *live*
    /// rows removed.
    async fn remove_all_slots(&self, key: &str, now_ms: u64) -> anyhow::Result<u64>;

    /// Sets a new expiration iff the slot row is live and its current
    /// expiration is non-null. Returns rows affected.
    async fn update_slot_expiration(
        &self,
        key: &str,
        slot_id: &str,
        expires_at_ms: u64,
        now_ms: u64,
    ) -> anyhow::Result<u64>;

    /// Returns the raw record (limit + all slot rows, expired included),
    /// or `None` when no rows exist.
    async fn find_slots(&self, key: &str) -> anyhow::Result<Option<SemaphoreRecord>>;
}

/// The adapter variant handed to a lock provider.
pub enum LockBackend {
    /// The backend provides the compound atomic primitives itself.
    Direct(Arc<dyn LockAdapter>),
    /// CRUD rows; normalized through [`LockAdapterBridge`].
    Database(Arc<dyn DatabaseLockAdapter>),
}

impl LockBackend {
    /// Normalizes to the direct contract. Database backends are wrapped in
    /// a bridge that owns the clock.
    #[must_use]
    pub fn normalize(self, clock: Arc<dyn ClockSource>) -> Arc<dyn LockAdapter> {
        match self {
            Self::Direct(adapter) => adapter,
            Self::Database(database) => Arc::new(LockAdapterBridge::new(database, clock)),
        }
    }
}

/// The adapter variant handed to a semaphore provider.
pub enum SemaphoreBackend {
    /// The backend provides the compound atomic primitives itself.
    Direct(Arc<dyn SemaphoreAdapter>),
    /// CRUD rows; normalized through [`SemaphoreAdapterBridge`].
    Database(Arc<dyn DatabaseSemaphoreAdapter>),
}

impl SemaphoreBackend {
    /// Normalizes to the direct contract. Database backends are wrapped in
    /// a bridge that owns the clock.
    #[must_use]
    pub fn normalize(self, clock: Arc<dyn ClockSource>) -> Arc<dyn SemaphoreAdapter> {
        match self {
            Self::Direct(adapter) => adapter,
            Self::Database(database) => Arc::new(SemaphoreAdapterBridge::new(database, clock)),
        }
    }
}

/// Serializes the direct lock contract into CRUD calls.
pub struct LockAdapterBridge {
    database: Arc<dyn DatabaseLockAdapter>,
    clock: Arc<dyn ClockSource>,
}

impl LockAdapterBridge {
    /// Wraps a database adapter; `clock` supplies the `now_ms` passed to
    /// every conditional row operation.
    #[must_use]
    pub fn new(database: Arc<dyn DatabaseLockAdapter>, clock: Arc<dyn ClockSource>) -> Self {
        Self { database, clock }
    }
}

#[async_trait]
impl LockAdapter for LockAdapterBridge {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        let expires_at_ms = expiry_from(ttl, now);

        if self.database.insert(key, owner, expires_at_ms).await? {
            return Ok(true);
        }
        if self
            .database
            .update_if_expired(key, owner, expires_at_ms, now)
            .await?
            > 0
        {
            return Ok(true);
        }
        match self.database.find(key).await? {
            // Same-owner re-acquire: a success that leaves the TTL alone.
            Some(row) => Ok(row.is_live(now) && row.owner == owner),
            // The row vanished between the conditional calls; one more
            // insert settles it either way.
            None => self.database.insert(key, owner, expires_at_ms).await,
        }
    }

    async fn release(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        Ok(self.database.remove_if_owner(key, owner, now).await? > 0)
    }

    async fn force_release(&self, key: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        Ok(self.database.remove_if_live(key, now).await? > 0)
    }

    async fn refresh(&self, key: &str, owner: &str, ttl: TimeSpan) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .database
            .update_expiration(key, owner, ttl.end_from(now), now)
            .await?
            > 0)
    }

    async fn get_state(&self, key: &str) -> anyhow::Result<Option<LockRecord>> {
        let now = self.clock.now_ms();
        Ok(self
            .database
            .find(key)
            .await?
            .filter(|row| row.is_live(now)))
    }
}

/// Serializes the direct semaphore contract into CRUD calls.
pub struct SemaphoreAdapterBridge {
    database: Arc<dyn DatabaseSemaphoreAdapter>,
    clock: Arc<dyn ClockSource>,
}

impl SemaphoreAdapterBridge {
    /// Wraps a database adapter; `clock` supplies the `now_ms` passed to
    /// every conditional row operation.
    #[must_use]
    pub fn new(
        database: Arc<dyn DatabaseSemaphoreAdapter>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self { database, clock }
    }
}

#[async_trait]
impl SemaphoreAdapter for SemaphoreAdapterBridge {
    async fn acquire(&self, request: SemaphoreAcquire<'_>) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        let expires_at_ms = expiry_from(request.ttl, now);
        let outcome = self
            .database
            .insert_slot(request.key, request.slot_id, request.limit, expires_at_ms, now)
            .await?;
        Ok(outcome != SlotInsert::LimitReached)
    }

    async fn release(&self, key: &str, slot_id: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        Ok(self.database.remove_slot(key, slot_id, now).await? > 0)
    }

    async fn force_release_all(&self, key: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        Ok(self.database.remove_all_slots(key, now).await? > 0)
    }

    async fn refresh(&self, key: &str, slot_id: &str, ttl: TimeSpan) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .database
            .update_slot_expiration(key, slot_id, ttl.end_from(now), now)
            .await?
            > 0)
    }

    async fn get_state(&self, key: &str) -> anyhow::Result<Option<SemaphoreRecord>> {
        let now = self.clock.now_ms();
        Ok(self.database.find_slots(key).await?.and_then(|mut record| {
            record.prune_expired(now);
            if record.slots.is_empty() {
                None
            } else {
                Some(record)
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::time::{is_live, ManualClock};

    /// Single-table lock rows behind a mutex: every contract call holds
    /// the lock for its whole body, which is exactly the per-call
    /// atomicity the bridge assumes of a real database.
    #[derive(Default)]
    struct MemoryLockTable {
        rows: Mutex<HashMap<String, LockRecord>>,
    }

    #[async_trait]
    impl DatabaseLockAdapter for MemoryLockTable {
        async fn insert(
            &self,
            key: &str,
            owner: &str,
            expires_at_ms: Option<u64>,
        ) -> anyhow::Result<bool> {
            let mut rows = self.rows.lock();
            if rows.contains_key(key) {
                return Ok(false);
            }
            rows.insert(
                key.to_string(),
                LockRecord {
                    owner: owner.to_string(),
                    expires_at_ms,
                },
            );
            Ok(true)
        }

        async fn update_if_expired(
            &self,
            key: &str,
            owner: &str,
            expires_at_ms: Option<u64>,
            now_ms: u64,
        ) -> anyhow::Result<u64> {
            let mut rows = self.rows.lock();
            match rows.get_mut(key) {
                Some(row) if !row.is_live(now_ms) => {
                    row.owner = owner.to_string();
                    row.expires_at_ms = expires_at_ms;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }

        async fn update_expiration(
            &self,
            key: &str,
            owner: &str,
            expires_at_ms: u64,
            now_ms: u64,
        ) -> anyhow::Result<u64> {
            let mut rows = self.rows.lock();
            match rows.get_mut(key) {
                Some(row)
                    if row.is_live(now_ms)
                        && row.owner == owner
                        && row.expires_at_ms.is_some() =>
                {
                    row.expires_at_ms = Some(expires_at_ms);
                    Ok(1)
                }
                _ => Ok(0),
            }
        }

        async fn remove_if_owner(
            &self,
            key: &str,
            owner: &str,
            now_ms: u64,
        ) -> anyhow::Result<u64> {
            let mut rows = self.rows.lock();
            match rows.get(key) {
                Some(row) if row.is_live(now_ms) && row.owner == owner => {
                    rows.remove(key);
                    Ok(1)
                }
                _ => Ok(0),
            }
        }

        async fn remove_if_live(&self, key: &str, now_ms: u64) -> anyhow::Result<u64> {
            let mut rows = self.rows.lock();
            match rows.get(key) {
                Some(row) if row.is_live(now_ms) => {
                    rows.remove(key);
                    Ok(1)
                }
                _ => Ok(0),
            }
        }

        async fn find(&self, key: &str) -> anyhow::Result<Option<LockRecord>> {
            Ok(self.rows.lock().get(key).cloned())
        }
    }

    /// One row per (key, slot); the limit travels with the rows.
    #[derive(Default)]
    struct MemorySemaphoreTable {
        rows: Mutex<HashMap<String, SemaphoreRecord>>,
    }

    #[async_trait]
    impl DatabaseSemaphoreAdapter for MemorySemaphoreTable {
        async fn insert_slot(
            &self,
            key: &str,
            slot_id: &str,
            limit: u32,
            expires_at_ms: Option<u64>,
            now_ms: u64,
        ) -> anyhow::Result<SlotInsert> {
            let mut rows = self.rows.lock();
            let record = rows
                .entry(key.to_string())
                .or_insert_with(|| SemaphoreRecord {
                    limit,
                    slots: std::collections::BTreeMap::new(),
                });
            record.prune_expired(now_ms);
            if record.slots.is_empty() {
                record.limit = limit;
            }
            if record.has_live_slot(slot_id, now_ms) {
                return Ok(SlotInsert::AlreadyHeld);
            }
            if record.live_slot_count(now_ms) < record.limit {
                record.slots.insert(slot_id.to_string(), expires_at_ms);
                Ok(SlotInsert::Inserted)
            } else {
                Ok(SlotInsert::LimitReached)
            }
        }

        async fn remove_slot(
            &self,
            key: &str,
            slot_id: &str,
            now_ms: u64,
        ) -> anyhow::Result<u64> {
            let mut rows = self.rows.lock();
            let Some(record) = rows.get_mut(key) else {
                return Ok(0);
            };
            let removed = match record.slots.get(slot_id) {
                Some(expires) if is_live(*expires, now_ms) => {
                    record.slots.remove(slot_id);
                    1
                }
                _ => 0,
            };
            if record.slots.is_empty() {
                rows.remove(key);
            }
            Ok(removed)
        }

        async fn remove_all_slots(&self, key: &str, now_ms: u64) -> anyhow::Result<u64> {
            let mut rows = self.rows.lock();
            match rows.remove(key) {
                Some(record) => Ok(u64::from(record.live_slot_count(now_ms))),
                None => Ok(0),
            }
        }

        async fn update_slot_expiration(
            &self,
            key: &str,
            slot_id: &str,
            expires_at_ms: u64,
            now_ms: u64,
        ) -> anyhow::Result<u64> {
            let mut rows = self.rows.lock();
            let Some(record) = rows.get_mut(key) else {
                return Ok(0);
            };
            match record.slots.get_mut(slot_id) {
                Some(expires) if is_live(*expires, now_ms) && expires.is_some() => {
                    *expires = Some(expires_at_ms);
                    Ok(1)
                }
                _ => Ok(0),
            }
        }

        async fn find_slots(&self, key: &str) -> anyhow::Result<Option<SemaphoreRecord>> {
            Ok(self.rows.lock().get(key).cloned())
        }
    }

    fn lock_bridge() -> (Arc<ManualClock>, LockAdapterBridge) {
        let clock = Arc::new(ManualClock::new(1_000));
        let bridge = LockAdapterBridge::new(
            Arc::new(MemoryLockTable::default()),
            Arc::clone(&clock) as Arc<dyn ClockSource>,
        );
        (clock, bridge)
    }

    fn semaphore_bridge() -> (Arc<ManualClock>, SemaphoreAdapterBridge) {
        let clock = Arc::new(ManualClock::new(1_000));
        let bridge = SemaphoreAdapterBridge::new(
            Arc::new(MemorySemaphoreTable::default()),
            Arc::clone(&clock) as Arc<dyn ClockSource>,
        );
        (clock, bridge)
    }

    #[tokio::test]
    async fn bridged_acquire_is_exclusive() {
        let (_, bridge) = lock_bridge();
        assert!(bridge.acquire("k", "a", None).await.unwrap());
        assert!(!bridge.acquire("k", "b", None).await.unwrap());
        assert!(bridge.acquire("k", "a", None).await.unwrap());
    }

    #[tokio::test]
    async fn bridged_reacquire_keeps_first_expiration() {
        let (clock, bridge) = lock_bridge();
        let ttl = Some(TimeSpan::from_millis(100));

        assert!(bridge.acquire("k", "a", ttl).await.unwrap());
        clock.advance(TimeSpan::from_millis(60));
        assert!(bridge.acquire("k", "a", ttl).await.unwrap());

        let state = bridge.get_state("k").await.unwrap().unwrap();
        assert_eq!(state.expires_at_ms, Some(1_100));

        clock.advance(TimeSpan::from_millis(60));
        assert!(bridge.acquire("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn bridged_takeover_of_expired_row() {
        let (clock, bridge) = lock_bridge();
        bridge
            .acquire("k", "a", Some(TimeSpan::from_millis(10)))
            .await
            .unwrap();
        clock.advance(TimeSpan::from_millis(11));

        // The dead row still occupies the table; insert fails but the
        // expired-row takeover succeeds.
        assert!(bridge.acquire("k", "b", None).await.unwrap());
        assert_eq!(bridge.get_state("k").await.unwrap().unwrap().owner, "b");
    }

    #[tokio::test]
    async fn bridged_release_and_force_release() {
        let (clock, bridge) = lock_bridge();
        bridge.acquire("k", "a", None).await.unwrap();

        assert!(!bridge.release("k", "b").await.unwrap());
        assert!(bridge.release("k", "a").await.unwrap());
        assert!(!bridge.release("k", "a").await.unwrap());

        bridge
            .acquire("k", "a", Some(TimeSpan::from_millis(10)))
            .await
            .unwrap();
        assert!(bridge.force_release("k").await.unwrap());

        bridge
            .acquire("k", "a", Some(TimeSpan::from_millis(10)))
            .await
            .unwrap();
        clock.advance(TimeSpan::from_millis(11));
        assert!(!bridge.force_release("k").await.unwrap());
    }

    #[tokio::test]
    async fn bridged_refresh_rules() {
        let (clock, bridge) = lock_bridge();

        bridge.acquire("null-ttl", "a", None).await.unwrap();
        assert!(!bridge
            .refresh("null-ttl", "a", TimeSpan::from_secs(1))
            .await
            .unwrap());

        bridge
            .acquire("k", "a", Some(TimeSpan::from_millis(50)))
            .await
            .unwrap();
        assert!(!bridge.refresh("k", "b", TimeSpan::from_secs(1)).await.unwrap());
        assert!(bridge.refresh("k", "a", TimeSpan::from_millis(200)).await.unwrap());
        assert_eq!(
            bridge.get_state("k").await.unwrap().unwrap().expires_at_ms,
            Some(1_200)
        );

        clock.advance(TimeSpan::from_millis(201));
        assert!(!bridge.refresh("k", "a", TimeSpan::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn bridged_semaphore_capacity_and_idempotence() {
        let (_, bridge) = semaphore_bridge();
        let request = |slot_id| SemaphoreAcquire {
            key: "k",
            slot_id,
            limit: 2,
            ttl: None,
        };

        assert!(bridge.acquire(request("s1")).await.unwrap());
        assert!(bridge.acquire(request("s1")).await.unwrap());
        assert!(bridge.acquire(request("s2")).await.unwrap());
        assert!(!bridge.acquire(request("s3")).await.unwrap());

        assert!(bridge.release("k", "s1").await.unwrap());
        assert!(bridge.acquire(request("s3")).await.unwrap());
    }

    #[tokio::test]
    async fn bridged_semaphore_limit_freeze_and_refresh() {
        let (clock, bridge) = semaphore_bridge();

        assert!(bridge
            .acquire(SemaphoreAcquire {
                key: "k",
                slot_id: "s1",
                limit: 2,
                ttl: Some(TimeSpan::from_millis(100)),
            })
            .await
            .unwrap());
        assert!(bridge
            .acquire(SemaphoreAcquire {
                key: "k",
                slot_id: "s2",
                limit: 5,
                ttl: None,
            })
            .await
            .unwrap());
        assert!(!bridge
            .acquire(SemaphoreAcquire {
                key: "k",
                slot_id: "s3",
                limit: 5,
                ttl: None,
            })
            .await
            .unwrap());

        assert_eq!(bridge.get_state("k").await.unwrap().unwrap().limit, 2);

        clock.advance(TimeSpan::from_millis(40));
        assert!(bridge.refresh("k", "s1", TimeSpan::from_millis(100)).await.unwrap());
        assert!(!bridge.refresh("k", "s2", TimeSpan::from_millis(100)).await.unwrap());

        let state = bridge.get_state("k").await.unwrap().unwrap();
        assert_eq!(state.slots.get("s1"), Some(&Some(1_140)));
    }

    #[tokio::test]
    async fn bridged_semaphore_force_release_and_expiry() {
        let (clock, bridge) = semaphore_bridge();

        assert!(!bridge.force_release_all("k").await.unwrap());

        bridge
            .acquire(SemaphoreAcquire {
                key: "k",
                slot_id: "s1",
                limit: 1,
                ttl: Some(TimeSpan::from_millis(20)),
            })
            .await
            .unwrap();
        clock.advance(TimeSpan::from_millis(21));

        assert!(bridge.get_state("k").await.unwrap().is_none());
        assert!(!bridge.force_release_all("k").await.unwrap());
    }

    #[tokio::test]
    async fn backend_normalize_picks_the_bridge() {
        let clock: Arc<dyn ClockSource> = Arc::new(ManualClock::new(0));
        let direct = LockBackend::Direct(Arc::new(crate::adapter::MemoryLockAdapter::new(
            Arc::clone(&clock),
        )))
        .normalize(Arc::clone(&clock));
        assert!(direct.acquire("k", "a", None).await.unwrap());

        let bridged = LockBackend::Database(Arc::new(MemoryLockTable::default()))
            .normalize(Arc::clone(&clock));
        assert!(bridged.acquire("k", "a", None).await.unwrap());
        assert!(!bridged.acquire("k", "b", None).await.unwrap());
    }
}
