//! Record shapes persisted by adapters.
//!
//! These are the abstract tuples every backend must expose to the primitive
//! layer: [`LockRecord`], [`SemaphoreRecord`], [`SharedLockState`], and
//! [`CacheEntry`]. Backends may carry extra columns for indexing but hand
//! exactly these shapes back. Expirations are absolute epoch milliseconds;
//! an entry at or past its expiration is treated as absent everywhere.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::time::{self, TimeSpan};

/// The persisted tuple for an exclusive lock (or the writer side of a
/// shared lock).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Opaque identity of the holder.
    pub owner: String,
    /// Absolute expiration, or `None` for an unexpireable lock.
    pub expires_at_ms: Option<u64>,
}

impl LockRecord {
    /// Whether the record is still live at `now_ms`.
    #[must_use]
    pub fn is_live(&self, now_ms: u64) -> bool {
        time::is_live(self.expires_at_ms, now_ms)
    }

    /// Remaining lifetime, or `None` when unexpireable.
    #[must_use]
    pub fn remaining(&self, now_ms: u64) -> Option<TimeSpan> {
        time::remaining(self.expires_at_ms, now_ms)
    }
}

/// The persisted tuple for a counting semaphore (or the reader side of a
/// shared lock).
///
/// `limit` is frozen while any unexpired slot exists: a differing limit on
/// a later acquire is ignored until the record drains. An expired slot is
/// treated as absent and lazily pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreRecord {
    /// Maximum number of concurrently live slots.
    pub limit: u32,
    /// Slot id to absolute expiration (`None` = the slot never expires).
    pub slots: BTreeMap<String, Option<u64>>,
}

impl SemaphoreRecord {
    /// Creates a record holding a single freshly acquired slot.
    #[must_use]
    pub fn with_slot(limit: u32, slot_id: &str, expires_at_ms: Option<u64>) -> Self {
        let mut slots = BTreeMap::new();
        slots.insert(slot_id.to_string(), expires_at_ms);
        Self { limit, slots }
    }

    /// Drops every slot whose expiration is at or before `now_ms`.
    pub fn prune_expired(&mut self, now_ms: u64) {
        self.slots.retain(|_, expires| time::is_live(*expires, now_ms));
    }

    /// Whether `slot_id` is present and live.
    #[must_use]
    pub fn has_live_slot(&self, slot_id: &str, now_ms: u64) -> bool {
        self.slots
            .get(slot_id)
            .is_some_and(|expires| time::is_live(*expires, now_ms))
    }

    /// Number of live slots at `now_ms`.
    #[must_use]
    pub fn live_slot_count(&self, now_ms: u64) -> u32 {
        let count = self
            .slots
            .values()
            .filter(|expires| time::is_live(**expires, now_ms))
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Ids of all live slots, in stored order.
    #[must_use]
    pub fn live_slot_ids(&self, now_ms: u64) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, expires)| time::is_live(**expires, now_ms))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Free capacity at `now_ms`.
    #[must_use]
    pub fn free_slot_count(&self, now_ms: u64) -> u32 {
        self.limit.saturating_sub(self.live_slot_count(now_ms))
    }
}

/// Snapshot of a shared-lock record.
///
/// At most one of `writer`, `reader` is present; operations against the
/// inactive mode return false without mutating state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SharedLockState {
    /// The exclusive writer, when the record is writer-held.
    pub writer: Option<LockRecord>,
    /// The bounded reader set, when the record is reader-held.
    pub reader: Option<SemaphoreRecord>,
}

impl SharedLockState {
    /// Whether neither side holds the record.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.writer.is_none() && self.reader.is_none()
    }
}

/// The persisted tuple for one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The stored value, serialized as JSON.
    pub value: serde_json::Value,
    /// Absolute expiration, or `None` for a persistent entry.
    pub expires_at_ms: Option<u64>,
}

impl CacheEntry {
    /// Whether the entry is still live at `now_ms`.
    #[must_use]
    pub fn is_live(&self, now_ms: u64) -> bool {
        time::is_live(self.expires_at_ms, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_record_liveness() {
        let live = LockRecord {
            owner: "a".to_string(),
            expires_at_ms: Some(2_000),
        };
        assert!(live.is_live(1_999));
        assert!(!live.is_live(2_000));

        let unexpireable = LockRecord {
            owner: "a".to_string(),
            expires_at_ms: None,
        };
        assert!(unexpireable.is_live(u64::MAX));
        assert_eq!(unexpireable.remaining(0), None);
    }

    #[test]
    fn semaphore_prune_drops_only_expired() {
        let mut record = SemaphoreRecord::with_slot(3, "s1", Some(1_000));
        record.slots.insert("s2".to_string(), Some(5_000));
        record.slots.insert("s3".to_string(), None);

        record.prune_expired(2_000);

        assert!(!record.slots.contains_key("s1"));
        assert!(record.has_live_slot("s2", 2_000));
        assert!(record.has_live_slot("s3", 2_000));
        assert_eq!(record.live_slot_count(2_000), 2);
        assert_eq!(record.free_slot_count(2_000), 1);
    }

    #[test]
    fn live_slot_ids_skips_expired_without_pruning() {
        let mut record = SemaphoreRecord::with_slot(2, "s1", Some(1_000));
        record.slots.insert("s2".to_string(), None);

        assert_eq!(record.live_slot_ids(2_000), vec!["s2".to_string()]);
        // The expired slot is still stored until someone prunes.
        assert_eq!(record.slots.len(), 2);
    }

    #[test]
    fn shared_state_default_is_free() {
        let state = SharedLockState::default();
        assert!(state.is_free());

        let writer_held = SharedLockState {
            writer: Some(LockRecord {
                owner: "w".to_string(),
                expires_at_ms: None,
            }),
            reader: None,
        };
        assert!(!writer_held.is_free());
    }

    #[test]
    fn cache_entry_liveness() {
        let entry = CacheEntry {
            value: serde_json::json!({"n": 1}),
            expires_at_ms: Some(100),
        };
        assert!(entry.is_live(99));
        assert!(!entry.is_live(100));
    }
}
