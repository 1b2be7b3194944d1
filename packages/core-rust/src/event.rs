//! Coordination event types and the dispatcher contract.
//!
//! Defines [`EventDispatcher`] for reacting to primitive state transitions,
//! and the event payloads each primitive emits. Dispatch is synchronous
//! fire-and-forget: primitives call [`EventDispatcher::dispatch`] after the
//! adapter call returns and before the operation resolves, and never await
//! listeners. Reliable fan-out is a dispatcher concern, not a primitive one.
//!
//! Implementations: [`NullEventDispatcher`] (default),
//! [`TracingEventDispatcher`], [`MemoryEventDispatcher`] (test assertions),
//! and [`CompositeEventDispatcher`] (fan-out to several dispatchers).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::time::TimeSpan;

/// Events emitted by the exclusive lock primitive.
///
/// Keys are always the resolved (un-namespaced) form.
#[derive(Debug, Clone, PartialEq)]
pub enum LockEvent {
    /// The lock was acquired (first acquire or idempotent re-acquire).
    Acquired {
        key: String,
        owner: String,
        ttl: Option<TimeSpan>,
    },
    /// The lock is held by a different owner.
    NotAvailable { key: String, owner: String },
    /// The lock was released by its owner.
    Released { key: String, owner: String },
    /// A release was refused: the caller does not hold the lock.
    UnownedReleaseTry { key: String, owner: String },
    /// The lock was removed regardless of owner.
    ForceReleased { key: String },
    /// The expiration was extended by the owner.
    Refreshed {
        key: String,
        owner: String,
        ttl: TimeSpan,
    },
    /// A refresh was refused: the caller does not hold the lock, or the
    /// lock is unexpireable.
    UnownedRefreshTry { key: String, owner: String },
    /// The adapter failed with an error the primitive could not classify.
    UnexpectedError {
        key: String,
        owner: String,
        message: String,
    },
}

/// Events emitted by the counting semaphore primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum SemaphoreEvent {
    /// A slot was acquired (or re-acquired idempotently).
    Acquired {
        key: String,
        slot_id: String,
        ttl: Option<TimeSpan>,
    },
    /// No free slot was available.
    LimitReached {
        key: String,
        slot_id: String,
        limit: u32,
    },
    /// The slot was released.
    Released { key: String, slot_id: String },
    /// A release was refused: the slot is expired or was never held.
    FailedRelease { key: String, slot_id: String },
    /// The slot's expiration was extended.
    Refreshed {
        key: String,
        slot_id: String,
        ttl: TimeSpan,
    },
    /// A refresh was refused for this slot.
    FailedRefresh { key: String, slot_id: String },
    /// All slots were force-released; `has_released` reports whether any
    /// unexpired slot existed.
    AllForceReleased { key: String, has_released: bool },
    /// The adapter failed with an error the primitive could not classify.
    UnexpectedError {
        key: String,
        slot_id: String,
        message: String,
    },
}

/// Events emitted by the shared (reader/writer) lock primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum SharedLockEvent {
    WriterAcquired {
        key: String,
        owner: String,
        ttl: Option<TimeSpan>,
    },
    /// Writer acquisition failed: another writer holds the key, or any
    /// reader slot is present.
    WriterNotAvailable { key: String, owner: String },
    WriterReleased { key: String, owner: String },
    WriterUnownedReleaseTry { key: String, owner: String },
    WriterRefreshed {
        key: String,
        owner: String,
        ttl: TimeSpan,
    },
    WriterUnownedRefreshTry { key: String, owner: String },
    /// The writer side was force-released; false when the record was
    /// absent or held by readers.
    WriterForceReleased { key: String, has_released: bool },
    ReaderAcquired {
        key: String,
        lock_id: String,
        ttl: Option<TimeSpan>,
    },
    /// Reader acquisition failed: capacity exhausted, or a writer holds
    /// the key.
    ReaderLimitReached {
        key: String,
        lock_id: String,
        limit: u32,
    },
    ReaderReleased { key: String, lock_id: String },
    ReaderFailedRelease { key: String, lock_id: String },
    ReaderRefreshed {
        key: String,
        lock_id: String,
        ttl: TimeSpan,
    },
    ReaderFailedRefresh { key: String, lock_id: String },
    /// All reader slots were force-released; false when the record was
    /// absent or held by a writer.
    AllReadersForceReleased { key: String, has_released: bool },
    /// Whichever side held the record was wiped.
    ForceReleased { key: String, has_released: bool },
    /// The adapter failed with an error the primitive could not classify.
    UnexpectedError { key: String, message: String },
}

/// Events emitted by the cache primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    KeyFound { key: String },
    KeyNotFound { key: String },
    KeyAdded { key: String, ttl: Option<TimeSpan> },
    KeyUpdated { key: String },
    KeyRemoved { key: String },
    KeyIncremented { key: String, delta: i64 },
    KeyDecremented { key: String, delta: i64 },
    /// All keys under the provider's namespace were removed.
    KeysCleared { prefix: String, removed: u64 },
}

/// Any event a coordination primitive can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationEvent {
    Lock(LockEvent),
    Semaphore(SemaphoreEvent),
    SharedLock(SharedLockEvent),
    Cache(CacheEvent),
}

impl From<LockEvent> for CoordinationEvent {
    fn from(event: LockEvent) -> Self {
        Self::Lock(event)
    }
}

impl From<SemaphoreEvent> for CoordinationEvent {
    fn from(event: SemaphoreEvent) -> Self {
        Self::Semaphore(event)
    }
}

impl From<SharedLockEvent> for CoordinationEvent {
    fn from(event: SharedLockEvent) -> Self {
        Self::SharedLock(event)
    }
}

impl From<CacheEvent> for CoordinationEvent {
    fn from(event: CacheEvent) -> Self {
        Self::Cache(event)
    }
}

/// Dispatch-only event channel consumed by the primitives.
///
/// Must be safe for concurrent emission; delivery is at-most-once from the
/// primitive's perspective. Used as `Arc<dyn EventDispatcher>` and passed
/// explicitly into every handle at construction.
pub trait EventDispatcher: Send + Sync {
    /// Delivers one event. Must not block the caller.
    fn dispatch(&self, event: CoordinationEvent);
}

/// No-op dispatcher, the default when a provider is built without one.
#[derive(Debug, Clone, Default)]
pub struct NullEventDispatcher;

impl EventDispatcher for NullEventDispatcher {
    fn dispatch(&self, _event: CoordinationEvent) {}
}

/// Dispatcher that forwards events to the `tracing` subscriber.
///
/// Unexpected-error events log at `warn`; everything else at `debug`.
#[derive(Debug, Clone, Default)]
pub struct TracingEventDispatcher;

impl EventDispatcher for TracingEventDispatcher {
    fn dispatch(&self, event: CoordinationEvent) {
        match &event {
            CoordinationEvent::Lock(LockEvent::UnexpectedError { .. })
            | CoordinationEvent::Semaphore(SemaphoreEvent::UnexpectedError { .. })
            | CoordinationEvent::SharedLock(SharedLockEvent::UnexpectedError { .. }) => {
                tracing::warn!(?event, "coordination event");
            }
            _ => tracing::debug!(?event, "coordination event"),
        }
    }
}

/// Dispatcher that records every event in memory.
///
/// Intended for tests and diagnostics: dispatch order is preserved per
/// emitting handle.
#[derive(Debug, Default)]
pub struct MemoryEventDispatcher {
    events: Mutex<Vec<CoordinationEvent>>,
}

impl MemoryEventDispatcher {
    /// Creates an empty recording dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, in dispatch order.
    #[must_use]
    pub fn events(&self) -> Vec<CoordinationEvent> {
        self.events.lock().clone()
    }

    /// Drains and returns all recorded events.
    #[must_use]
    pub fn take(&self) -> Vec<CoordinationEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventDispatcher for MemoryEventDispatcher {
    fn dispatch(&self, event: CoordinationEvent) {
        self.events.lock().push(event);
    }
}

/// Dispatcher that fans events out to `tokio::sync::broadcast`
/// subscribers.
///
/// The subscription side is how listeners consume events without the
/// primitives ever awaiting them: dispatch is a non-blocking send, and a
/// send with no subscribers (or a lagging subscriber) is silently dropped
/// -- delivery is at-most-once.
pub struct BroadcastEventDispatcher {
    sender: tokio::sync::broadcast::Sender<CoordinationEvent>,
}

impl BroadcastEventDispatcher {
    /// Creates a dispatcher whose channel buffers up to `capacity` events
    /// per subscriber before lagging.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Opens a new subscription. Events dispatched before the call are
    /// not replayed.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }
}

impl EventDispatcher for BroadcastEventDispatcher {
    fn dispatch(&self, event: CoordinationEvent) {
        // No subscribers is not an error for fire-and-forget delivery.
        let _ = self.sender.send(event);
    }
}

/// Composite dispatcher that fans out to multiple dispatchers.
#[derive(Default)]
pub struct CompositeEventDispatcher {
    dispatchers: Vec<Arc<dyn EventDispatcher>>,
}

impl CompositeEventDispatcher {
    /// Creates a composite over the given list of dispatchers.
    #[must_use]
    pub fn new(dispatchers: Vec<Arc<dyn EventDispatcher>>) -> Self {
        Self { dispatchers }
    }

    /// Adds a dispatcher after construction.
    pub fn add(&mut self, dispatcher: Arc<dyn EventDispatcher>) {
        self.dispatchers.push(dispatcher);
    }
}

impl EventDispatcher for CompositeEventDispatcher {
    fn dispatch(&self, event: CoordinationEvent) {
        for dispatcher in &self.dispatchers {
            dispatcher.dispatch(event.clone());
        }
    }
}
