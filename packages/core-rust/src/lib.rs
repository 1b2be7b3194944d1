//! Holdfast core -- distributed coordination and caching primitives over
//! pluggable storage adapters.
//!
//! - **Key & namespace** ([`key`]): canonical resolved/stored key pairs
//! - **Time** ([`time`]): `TimeSpan` durations, `ClockSource` injection
//! - **Events** ([`event`]): typed events, fire-and-forget dispatchers
//! - **Adapters** ([`adapter`]): direct and database contracts, bridges,
//!   in-memory reference backends
//! - **Lock** ([`lock`]): exclusive owner semantics with TTL and refresh
//! - **Semaphore** ([`semaphore`]): bounded concurrent holders with slot
//!   identity
//! - **Shared lock** ([`shared`]): single writer XOR bounded readers
//! - **Cache** ([`cache`]): typed key→value map with per-entry TTL
//! - **Wire** ([`wire`]): versioned handle shapes for cross-process
//!   transport

pub mod adapter;
pub mod cache;
pub mod event;
pub mod key;
pub mod lock;
pub mod semaphore;
pub mod shared;
pub mod time;
pub mod wire;

// Key & namespace
pub use key::{Key, Namespace};

// Time
pub use time::{ClockSource, ManualClock, SystemClock, TimeSpan};

// Events
pub use event::{
    BroadcastEventDispatcher, CacheEvent, CompositeEventDispatcher, CoordinationEvent,
    EventDispatcher, LockEvent, MemoryEventDispatcher, NullEventDispatcher, SemaphoreEvent,
    SharedLockEvent, TracingEventDispatcher,
};

// Adapters
pub use adapter::{
    CacheAdapter, CacheEntry, DatabaseLockAdapter, DatabaseSemaphoreAdapter, IncrementOutcome,
    LockAdapter, LockAdapterBridge, LockBackend, LockRecord, MemoryCacheAdapter,
    MemoryLockAdapter, MemorySemaphoreAdapter, MemorySharedLockAdapter, ReaderAcquire,
    SemaphoreAcquire, SemaphoreAdapter, SemaphoreAdapterBridge, SemaphoreBackend,
    SemaphoreRecord, SharedLockAdapter, SharedLockState, SlotInsert,
};

// Primitives
pub use cache::{Cache, CacheError, CacheOptions};
pub use lock::{
    BlockingOptions, Lock, LockError, LockOptions, LockProvider, LockProviderOptions,
};
pub use semaphore::{
    Semaphore, SemaphoreError, SemaphoreOptions, SemaphoreProvider, SemaphoreProviderOptions,
    SemaphoreStateView,
};
pub use shared::{
    SharedLock, SharedLockError, SharedLockOptions, SharedLockProvider,
    SharedLockProviderOptions,
};

// Wire
pub use wire::{
    LockHandleWire, SemaphoreHandleWire, SharedLockHandleWire, WireError, WIRE_VERSION,
};


/// Integration tests across providers, adapters, and the wire format.
///
/// These walk the end-to-end guarantees the primitives make: TTL
/// preservation on re-acquire, unowned refresh, semaphore idempotence,
/// shared-lock mode lockout, limit freeze, and run-family release.
#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;

    use crate::adapter::{
        MemoryLockAdapter, MemorySemaphoreAdapter, MemorySharedLockAdapter,
    };
    use crate::lock::{LockOptions, LockProvider, LockProviderOptions};
    use crate::semaphore::{SemaphoreOptions, SemaphoreProvider, SemaphoreProviderOptions};
    use crate::shared::{SharedLockOptions, SharedLockProvider, SharedLockProviderOptions};
    use crate::time::{ClockSource, ManualClock, TimeSpan};
    use crate::{LockBackend, LockError, SemaphoreBackend, SemaphoreStateView};

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(10_000))
    }

    fn lock_provider(clock: &Arc<ManualClock>) -> LockProvider {
        LockProvider::new(
            LockBackend::Direct(Arc::new(MemoryLockAdapter::new(
                Arc::clone(clock) as Arc<dyn ClockSource>
            ))),
            LockProviderOptions {
                clock: Arc::clone(clock) as Arc<dyn ClockSource>,
                ..LockProviderOptions::default()
            },
        )
    }

    fn semaphore_provider(clock: &Arc<ManualClock>) -> SemaphoreProvider {
        SemaphoreProvider::new(
            SemaphoreBackend::Direct(Arc::new(MemorySemaphoreAdapter::new(
                Arc::clone(clock) as Arc<dyn ClockSource>
            ))),
            SemaphoreProviderOptions {
                clock: Arc::clone(clock) as Arc<dyn ClockSource>,
                ..SemaphoreProviderOptions::default()
            },
        )
    }

    fn shared_provider(clock: &Arc<ManualClock>) -> SharedLockProvider {
        SharedLockProvider::new(
            Arc::new(MemorySharedLockAdapter::new(
                Arc::clone(clock) as Arc<dyn ClockSource>
            )),
            SharedLockProviderOptions::default(),
        )
    }

    /// A lock re-acquired by its owner keeps the expiration of the FIRST
    /// acquire.
    #[tokio::test]
    async fn lock_reacquire_preserves_ttl() {
        let clock = manual_clock();
        let provider = lock_provider(&clock);
        let lock_a = provider.create_with(
            "k",
            LockOptions {
                owner: Some("A".to_string()),
                ttl: Some(TimeSpan::from_millis(100)),
            },
        );
        let lock_b = provider.create_with(
            "k",
            LockOptions {
                owner: Some("B".to_string()),
                ttl: None,
            },
        );

        assert!(lock_a.acquire().await.unwrap());
        clock.advance(TimeSpan::from_millis(60));
        assert!(lock_a.acquire().await.unwrap());
        clock.advance(TimeSpan::from_millis(60));

        assert!(lock_b.acquire().await.unwrap());
    }

    /// An unowned refresh changes nothing; the record still shows the
    /// original owner and expiration.
    #[tokio::test]
    async fn unowned_refresh_is_a_no_op() {
        let clock = manual_clock();
        let provider = lock_provider(&clock);
        let lock_a = provider.create_with(
            "k",
            LockOptions {
                owner: Some("A".to_string()),
                ttl: Some(TimeSpan::from_millis(50)),
            },
        );
        let lock_b = provider.create_with(
            "k",
            LockOptions {
                owner: Some("B".to_string()),
                ttl: Some(TimeSpan::from_millis(50)),
            },
        );

        lock_a.acquire().await.unwrap();
        assert!(!lock_b.refresh_with(TimeSpan::from_mins(1)).await.unwrap());

        let state = lock_a.get_state().await.unwrap().unwrap();
        assert_eq!(state.owner, "A");
        assert_eq!(state.expires_at_ms, Some(10_050));
    }

    /// Slot acquisition is idempotent and capacity-bounded; releasing a
    /// slot frees capacity for a blocked holder.
    #[tokio::test]
    async fn semaphore_idempotence_and_capacity() {
        let clock = manual_clock();
        let provider = semaphore_provider(&clock);
        let make = |slot: &str| {
            provider.create_with(
                "k",
                2,
                SemaphoreOptions {
                    slot_id: Some(slot.to_string()),
                    ttl: None,
                },
            )
        };
        let s1 = make("s1");
        let s2 = make("s2");
        let s3 = make("s3");

        assert!(s1.acquire().await.unwrap());
        assert!(s1.acquire().await.unwrap());
        assert!(s2.acquire().await.unwrap());
        assert!(!s3.acquire().await.unwrap());

        assert!(s1.release().await.unwrap());
        assert!(s3.acquire().await.unwrap());
    }

    /// A reader record locks out the writer side entirely.
    #[tokio::test]
    async fn shared_lock_mode_lockout() {
        let clock = manual_clock();
        let provider = shared_provider(&clock);
        let reader = provider.create_with(
            "k",
            2,
            SharedLockOptions {
                lock_id: Some("r1".to_string()),
                ttl: None,
            },
        );
        let writer = provider.create_with(
            "k",
            2,
            SharedLockOptions {
                lock_id: Some("w1".to_string()),
                ttl: None,
            },
        );

        assert!(reader.acquire_reader().await.unwrap());
        assert!(!writer.acquire_writer().await.unwrap());

        let state = reader.get_state().await.unwrap();
        assert!(state.writer.is_none());
        let readers = state.reader.unwrap();
        assert_eq!(readers.limit, 2);
        assert_eq!(readers.slots.get("r1"), Some(&None));
    }

    /// The reader limit recorded first is enforced until the record
    /// drains, whatever later handles request.
    #[tokio::test]
    async fn shared_lock_limit_freeze() {
        let clock = manual_clock();
        let provider = shared_provider(&clock);
        let make = |id: &str, limit: u32| {
            provider.create_with(
                "k",
                limit,
                SharedLockOptions {
                    lock_id: Some(id.to_string()),
                    ttl: None,
                },
            )
        };

        assert!(make("r1", 2).acquire_reader().await.unwrap());
        assert!(make("r2", 3).acquire_reader().await.unwrap());
        assert!(!make("r3", 3).acquire_reader().await.unwrap());
    }

    /// The run-family releases even when the body fails, so the key is
    /// immediately reacquirable.
    #[tokio::test]
    async fn run_releases_on_body_failure() {
        let clock = manual_clock();
        let provider = lock_provider(&clock);
        let lock = provider.create_with(
            "k",
            LockOptions {
                owner: Some("A".to_string()),
                ttl: None,
            },
        );

        let result: Result<Result<(), &str>, LockError> =
            lock.run(|| async { Err("worker failed") }).await;
        assert_eq!(result.unwrap(), Err("worker failed"));

        let other = provider.create_with(
            "k",
            LockOptions {
                owner: Some("B".to_string()),
                ttl: None,
            },
        );
        assert!(other.acquire().await.unwrap());
    }

    /// A handle serialized in one "process" and imported in another
    /// operates on the same record when both share the adapter.
    #[tokio::test]
    async fn wire_round_trip_across_providers() {
        let clock = manual_clock();
        let adapter = Arc::new(MemorySemaphoreAdapter::new(
            Arc::clone(&clock) as Arc<dyn ClockSource>
        ));

        let exporter = SemaphoreProvider::new(
            SemaphoreBackend::Direct(Arc::clone(&adapter) as Arc<dyn crate::SemaphoreAdapter>),
            SemaphoreProviderOptions {
                clock: Arc::clone(&clock) as Arc<dyn ClockSource>,
                ..SemaphoreProviderOptions::default()
            },
        );
        let importer = SemaphoreProvider::new(
            SemaphoreBackend::Direct(Arc::clone(&adapter) as Arc<dyn crate::SemaphoreAdapter>),
            SemaphoreProviderOptions {
                clock: Arc::clone(&clock) as Arc<dyn ClockSource>,
                ..SemaphoreProviderOptions::default()
            },
        );

        let original = exporter.create_with(
            "pool",
            2,
            SemaphoreOptions {
                slot_id: Some("s1".to_string()),
                ttl: None,
            },
        );
        original.acquire().await.unwrap();

        // Simulate transport: serialize the wire shape to JSON and back.
        let json = serde_json::to_string(&original.export()).unwrap();
        let wire = serde_json::from_str(&json).unwrap();
        let imported = importer.import(&wire).unwrap();

        assert!(imported.release().await.unwrap());
        assert_eq!(
            original.get_state().await.unwrap(),
            SemaphoreStateView::Unacquired {
                limit: 2,
                acquired_slots_count: 0,
                free_slots_count: 2,
            }
        );
    }
}
