//! In-memory reference adapters backed by [`DashMap`].
//!
//! One adapter per primitive. Compound operations run under the map's
//! entry API, which holds the shard lock for the duration of the closure
//! and gives the per-key atomicity the contracts require. Expiry is lazy:
//! dead entries are pruned by the next write that observes them; reads
//! simply report them as absent.
//!
//! Suitable for tests, single-process deployments, and as the reference
//! semantics other backends are checked against.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use async_trait::async_trait;

use super::contracts::{
    CacheAdapter, IncrementOutcome, LockAdapter, ReaderAcquire, SemaphoreAcquire,
    SemaphoreAdapter, SharedLockAdapter,
};
use super::record::{CacheEntry, LockRecord, SemaphoreRecord, SharedLockState};
use crate::time::{expiry_from, ClockSource, SystemClock, TimeSpan};

/// In-memory [`LockAdapter`].
pub struct MemoryLockAdapter {
    entries: DashMap<String, LockRecord>,
    clock: Arc<dyn ClockSource>,
}

impl MemoryLockAdapter {
    /// Creates an empty adapter reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

impl Default for MemoryLockAdapter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl LockAdapter for MemoryLockAdapter {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.insert(LockRecord {
                        owner: owner.to_string(),
                        expires_at_ms: expiry_from(ttl, now),
                    });
                    return Ok(true);
                }
                // Same owner re-acquire: succeed without touching the TTL.
                Ok(occupied.get().owner == owner)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockRecord {
                    owner: owner.to_string(),
                    expires_at_ms: expiry_from(ttl, now),
                });
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    return Ok(false);
                }
                if occupied.get().owner == owner {
                    occupied.remove();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn force_release(&self, key: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let was_live = occupied.get().is_live(now);
                occupied.remove();
                Ok(was_live)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn refresh(&self, key: &str, owner: &str, ttl: TimeSpan) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    return Ok(false);
                }
                let record = occupied.get_mut();
                if record.owner == owner && record.expires_at_ms.is_some() {
                    record.expires_at_ms = Some(ttl.end_from(now));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn get_state(&self, key: &str) -> anyhow::Result<Option<LockRecord>> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.clone()))
    }
}

/// In-memory [`SemaphoreAdapter`].
pub struct MemorySemaphoreAdapter {
    entries: DashMap<String, SemaphoreRecord>,
    clock: Arc<dyn ClockSource>,
}

impl MemorySemaphoreAdapter {
    /// Creates an empty adapter reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

impl Default for MemorySemaphoreAdapter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// Applies the semaphore acquire rules to a record already pruned of
/// expired slots. Shared with the reader side of the shared lock.
fn acquire_slot(
    record: &mut SemaphoreRecord,
    slot_id: &str,
    requested_limit: u32,
    expires_at_ms: Option<u64>,
) -> bool {
    if record.slots.is_empty() {
        // The limit may only change while no slot is held.
        record.limit = requested_limit;
    }
    if record.slots.contains_key(slot_id) {
        // Idempotent re-acquire: the TTL is not updated.
        return true;
    }
    let held = u32::try_from(record.slots.len()).unwrap_or(u32::MAX);
    if held < record.limit {
        record.slots.insert(slot_id.to_string(), expires_at_ms);
        true
    } else {
        false
    }
}

/// Refreshes one slot in place. Only expirable (non-null) slots refresh.
fn refresh_slot(record: &mut SemaphoreRecord, slot_id: &str, ttl: TimeSpan, now: u64) -> bool {
    match record.slots.get_mut(slot_id) {
        Some(expires) if expires.is_some() => {
            *expires = Some(ttl.end_from(now));
            true
        }
        _ => false,
    }
}

#[async_trait]
impl SemaphoreAdapter for MemorySemaphoreAdapter {
    async fn acquire(&self, request: SemaphoreAcquire<'_>) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        let expires_at_ms = expiry_from(request.ttl, now);
        match self.entries.entry(request.key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.prune_expired(now);
                Ok(acquire_slot(
                    record,
                    request.slot_id,
                    request.limit,
                    expires_at_ms,
                ))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SemaphoreRecord::with_slot(
                    request.limit,
                    request.slot_id,
                    expires_at_ms,
                ));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, slot_id: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.prune_expired(now);
                let removed = record.slots.remove(slot_id).is_some();
                if record.slots.is_empty() {
                    occupied.remove();
                }
                Ok(removed)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn force_release_all(&self, key: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let had_live = occupied.get().live_slot_count(now) > 0;
                occupied.remove();
                Ok(had_live)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn refresh(&self, key: &str, slot_id: &str, ttl: TimeSpan) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.prune_expired(now);
                if record.slots.is_empty() {
                    occupied.remove();
                    return Ok(false);
                }
                Ok(refresh_slot(record, slot_id, ttl, now))
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn get_state(&self, key: &str) -> anyhow::Result<Option<SemaphoreRecord>> {
        let now = self.clock.now_ms();
        Ok(self.entries.get(key).and_then(|record| {
            let mut snapshot = record.clone();
            snapshot.prune_expired(now);
            if snapshot.slots.is_empty() {
                None
            } else {
                Some(snapshot)
            }
        }))
    }
}

/// Which side currently holds a shared-lock record.
#[derive(Debug, Clone)]
enum SharedRecord {
    Writer(LockRecord),
    Readers(SemaphoreRecord),
}

/// In-memory [`SharedLockAdapter`].
pub struct MemorySharedLockAdapter {
    entries: DashMap<String, SharedRecord>,
    clock: Arc<dyn ClockSource>,
}

impl MemorySharedLockAdapter {
    /// Creates an empty adapter reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

impl Default for MemorySharedLockAdapter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SharedRecord {
    /// Whether the record still blocks a mode transition at `now`.
    fn is_live(&self, now: u64) -> bool {
        match self {
            Self::Writer(writer) => writer.is_live(now),
            Self::Readers(readers) => readers.live_slot_count(now) > 0,
        }
    }
}

#[async_trait]
impl SharedLockAdapter for MemorySharedLockAdapter {
    async fn acquire_writer(
        &self,
        key: &str,
        owner: &str,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        let fresh = SharedRecord::Writer(LockRecord {
            owner: owner.to_string(),
            expires_at_ms: expiry_from(ttl, now),
        });
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.insert(fresh);
                    return Ok(true);
                }
                match occupied.get() {
                    SharedRecord::Writer(writer) => Ok(writer.owner == owner),
                    SharedRecord::Readers(_) => Ok(false),
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn release_writer(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => match occupied.get() {
                SharedRecord::Writer(writer) => {
                    if !writer.is_live(now) {
                        occupied.remove();
                        return Ok(false);
                    }
                    if writer.owner == owner {
                        occupied.remove();
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                SharedRecord::Readers(_) => Ok(false),
            },
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn refresh_writer(
        &self,
        key: &str,
        owner: &str,
        ttl: TimeSpan,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                SharedRecord::Writer(writer) => {
                    if !writer.is_live(now) {
                        occupied.remove();
                        return Ok(false);
                    }
                    if writer.owner == owner && writer.expires_at_ms.is_some() {
                        writer.expires_at_ms = Some(ttl.end_from(now));
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                SharedRecord::Readers(_) => Ok(false),
            },
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn force_release_writer(&self, key: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => match occupied.get() {
                SharedRecord::Writer(writer) => {
                    let was_live = writer.is_live(now);
                    occupied.remove();
                    Ok(was_live)
                }
                SharedRecord::Readers(_) => Ok(false),
            },
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn acquire_reader(&self, request: ReaderAcquire<'_>) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        let expires_at_ms = expiry_from(request.ttl, now);
        match self.entries.entry(request.key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.insert(SharedRecord::Readers(SemaphoreRecord::with_slot(
                        request.limit,
                        request.lock_id,
                        expires_at_ms,
                    )));
                    return Ok(true);
                }
                match occupied.get_mut() {
                    SharedRecord::Readers(readers) => {
                        readers.prune_expired(now);
                        Ok(acquire_slot(
                            readers,
                            request.lock_id,
                            request.limit,
                            expires_at_ms,
                        ))
                    }
                    SharedRecord::Writer(_) => Ok(false),
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SharedRecord::Readers(SemaphoreRecord::with_slot(
                    request.limit,
                    request.lock_id,
                    expires_at_ms,
                )));
                Ok(true)
            }
        }
    }

    async fn release_reader(&self, key: &str, lock_id: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                SharedRecord::Readers(readers) => {
                    readers.prune_expired(now);
                    let removed = readers.slots.remove(lock_id).is_some();
                    if readers.slots.is_empty() {
                        occupied.remove();
                    }
                    Ok(removed)
                }
                SharedRecord::Writer(_) => Ok(false),
            },
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn refresh_reader(
        &self,
        key: &str,
        lock_id: &str,
        ttl: TimeSpan,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                SharedRecord::Readers(readers) => {
                    readers.prune_expired(now);
                    if readers.slots.is_empty() {
                        occupied.remove();
                        return Ok(false);
                    }
                    Ok(refresh_slot(readers, lock_id, ttl, now))
                }
                SharedRecord::Writer(_) => Ok(false),
            },
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn force_release_all_readers(&self, key: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => match occupied.get() {
                SharedRecord::Readers(readers) => {
                    let had_live = readers.live_slot_count(now) > 0;
                    occupied.remove();
                    Ok(had_live)
                }
                SharedRecord::Writer(_) => Ok(false),
            },
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn force_release(&self, key: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let was_live = occupied.get().is_live(now);
                occupied.remove();
                Ok(was_live)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn get_state(&self, key: &str) -> anyhow::Result<SharedLockState> {
        let now = self.clock.now_ms();
        let state = self
            .entries
            .get(key)
            .map(|record| match record.value() {
                SharedRecord::Writer(writer) if writer.is_live(now) => SharedLockState {
                    writer: Some(writer.clone()),
                    reader: None,
                },
                SharedRecord::Readers(readers) => {
                    let mut snapshot = readers.clone();
                    snapshot.prune_expired(now);
                    if snapshot.slots.is_empty() {
                        SharedLockState::default()
                    } else {
                        SharedLockState {
                            writer: None,
                            reader: Some(snapshot),
                        }
                    }
                }
                SharedRecord::Writer(_) => SharedLockState::default(),
            })
            .unwrap_or_default();
        Ok(state)
    }
}

/// In-memory [`CacheAdapter`].
pub struct MemoryCacheAdapter {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn ClockSource>,
}

impl MemoryCacheAdapter {
    /// Creates an empty adapter reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

impl Default for MemoryCacheAdapter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

/// Adds `delta` to a JSON number, keeping the integer representation when
/// the stored value is integral.
// f64 holds any i64 delta close enough for cache counters.
#[allow(clippy::cast_precision_loss)]
fn add_delta(number: &serde_json::Number, delta: i64) -> serde_json::Value {
    if let Some(int) = number.as_i64() {
        return serde_json::Value::from(int.saturating_add(delta));
    }
    if let Some(uint) = number.as_u64() {
        let sum = i128::from(uint) + i128::from(delta);
        if sum < 0 {
            return serde_json::Value::from(i64::try_from(sum).unwrap_or(i64::MIN));
        }
        return serde_json::Value::from(u64::try_from(sum).unwrap_or(u64::MAX));
    }
    let sum = number.as_f64().unwrap_or(0.0) + delta as f64;
    serde_json::Number::from_f64(sum)
        .map_or_else(|| serde_json::Value::Number(number.clone()), serde_json::Value::Number)
}

#[async_trait]
impl CacheAdapter for MemoryCacheAdapter {
    async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn add(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        let fresh = CacheEntry {
            value,
            expires_at_ms: expiry_from(ttl, now),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn update(&self, key: &str, value: serde_json::Value) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    return Ok(false);
                }
                occupied.get_mut().value = value;
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<TimeSpan>,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        let fresh = CacheEntry {
            value,
            expires_at_ms: expiry_from(ttl, now),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let replaced_live = occupied.get().is_live(now);
                occupied.insert(fresh);
                Ok(replaced_live)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(false)
            }
        }
    }

    async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let was_live = occupied.get().is_live(now);
                occupied.remove();
                Ok(was_live)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn get_and_remove(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.remove();
                Ok(entry.is_live(now).then_some(entry.value))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> anyhow::Result<IncrementOutcome> {
        let now = self.clock.now_ms();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    return Ok(IncrementOutcome::Missing);
                }
                let entry = occupied.get_mut();
                match &entry.value {
                    serde_json::Value::Number(number) => {
                        // Expiration is preserved; only the value moves.
                        let updated = add_delta(number, delta);
                        entry.value = updated;
                        Ok(IncrementOutcome::Incremented)
                    }
                    _ => Ok(IncrementOutcome::NotNumeric),
                }
            }
            Entry::Vacant(_) => Ok(IncrementOutcome::Missing),
        }
    }

    async fn clear(&self, prefix: &str) -> anyhow::Result<u64> {
        let mut removed = 0u64;
        self.entries.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}
