//! Counting semaphore primitive.
//!
//! Same lifecycle surface as the exclusive lock with a slot id in place of
//! an owner and a capacity fixed when the handle is minted. Acquire is
//! idempotent per slot id: a second acquire for the same slot returns true
//! without consuming capacity or extending the slot's TTL. The limit
//! recorded on first insert is enforced until the record drains -- limits
//! are not voted or averaged.

use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::adapter::{SemaphoreAcquire, SemaphoreAdapter, SemaphoreBackend};
use crate::event::{EventDispatcher, NullEventDispatcher, SemaphoreEvent};
use crate::key::{Key, Namespace};
use crate::lock::BlockingOptions;
use crate::time::{self, ClockSource, SystemClock, TimeSpan};
use crate::wire::{check_version, SemaphoreHandleWire, WireError, WIRE_VERSION};

/// Default TTL for slots minted by [`SemaphoreProvider::create`].
pub const DEFAULT_SEMAPHORE_TTL: TimeSpan = TimeSpan::from_mins(5);

/// Errors surfaced by the semaphore primitive.
#[derive(Debug, thiserror::Error)]
pub enum SemaphoreError {
    #[error("semaphore \"{key}\" has no free slot for \"{slot_id}\"")]
    LimitReached { key: String, slot_id: String },
    #[error("semaphore \"{key}\" slot was not acquired within {waited_ms}ms")]
    AcquireTimeout {
        key: String,
        slot_id: String,
        waited_ms: u64,
    },
    #[error("release of semaphore \"{key}\" refused: slot \"{slot_id}\" not held")]
    FailedRelease { key: String, slot_id: String },
    #[error("refresh of semaphore \"{key}\" refused: slot \"{slot_id}\" not held or unexpireable")]
    FailedRefresh { key: String, slot_id: String },
    #[error("adapter fault while acquiring semaphore \"{key}\"")]
    UnableToAcquire {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("adapter fault while releasing semaphore \"{key}\"")]
    UnableToRelease {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("adapter fault while operating on semaphore \"{key}\"")]
    Unexpected {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Structured view returned by [`Semaphore::get_state`], interpreted
/// relative to this handle's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreStateView {
    /// This handle's slot is live.
    Acquired {
        limit: u32,
        acquired_slots: Vec<String>,
        acquired_slots_count: u32,
        free_slots_count: u32,
        /// Remaining lifetime of this handle's slot; `None` when the slot
        /// never expires.
        remaining_time: Option<TimeSpan>,
    },
    /// The slot is not held and capacity remains.
    Unacquired {
        limit: u32,
        acquired_slots_count: u32,
        free_slots_count: u32,
    },
    /// The slot is not held and every slot is taken by others.
    LimitReached {
        limit: u32,
        acquired_slots: Vec<String>,
    },
    /// This handle held a slot whose expiration has passed.
    Expired,
}

/// Configuration for a [`SemaphoreProvider`].
pub struct SemaphoreProviderOptions {
    pub namespace: Namespace,
    /// TTL given to slots minted by [`SemaphoreProvider::create`].
    pub default_ttl: Option<TimeSpan>,
    pub default_blocking: BlockingOptions,
    /// TTL applied by [`Semaphore::refresh`].
    pub default_refresh_ttl: TimeSpan,
    pub clock: Arc<dyn ClockSource>,
    pub event_dispatcher: Arc<dyn EventDispatcher>,
}

impl Default for SemaphoreProviderOptions {
    fn default() -> Self {
        Self {
            namespace: Namespace::new("holdfast").group("semaphore"),
            default_ttl: Some(DEFAULT_SEMAPHORE_TTL),
            default_blocking: BlockingOptions::default(),
            default_refresh_ttl: DEFAULT_SEMAPHORE_TTL,
            clock: Arc::new(SystemClock),
            event_dispatcher: Arc::new(NullEventDispatcher),
        }
    }
}

/// Explicit settings for [`SemaphoreProvider::create_with`].
///
/// Nothing here falls back to provider defaults: `slot_id: None` generates
/// an identity, `ttl: None` mints a slot that never expires.
#[derive(Debug, Clone, Default)]
pub struct SemaphoreOptions {
    pub slot_id: Option<String>,
    pub ttl: Option<TimeSpan>,
}

/// Factory for [`Semaphore`] handles sharing one adapter and namespace.
#[derive(Clone)]
pub struct SemaphoreProvider {
    adapter: Arc<dyn SemaphoreAdapter>,
    namespace: Namespace,
    default_ttl: Option<TimeSpan>,
    default_blocking: BlockingOptions,
    default_refresh_ttl: TimeSpan,
    clock: Arc<dyn ClockSource>,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl SemaphoreProvider {
    /// Creates a provider over `backend`, normalizing database-flavor
    /// adapters through a bridge.
    #[must_use]
    pub fn new(backend: SemaphoreBackend, options: SemaphoreProviderOptions) -> Self {
        let adapter = backend.normalize(Arc::clone(&options.clock));
        Self {
            adapter,
            namespace: options.namespace,
            default_ttl: options.default_ttl,
            default_blocking: options.default_blocking,
            default_refresh_ttl: options.default_refresh_ttl,
            clock: options.clock,
            dispatcher: options.event_dispatcher,
        }
    }

    /// Mints a handle with a generated slot id and the provider default
    /// TTL. `limit` is the capacity this handle will request.
    #[must_use]
    pub fn create(&self, key: &str, limit: u32) -> Semaphore {
        self.create_with(
            key,
            limit,
            SemaphoreOptions {
                slot_id: None,
                ttl: self.default_ttl,
            },
        )
    }

    /// Mints a handle with explicit settings; see [`SemaphoreOptions`].
    #[must_use]
    pub fn create_with(&self, key: &str, limit: u32, options: SemaphoreOptions) -> Semaphore {
        Semaphore {
            key: self.namespace.key(key),
            slot_id: options
                .slot_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            limit,
            ttl: options.ttl,
            blocking: self.default_blocking,
            refresh_ttl: self.default_refresh_ttl,
            adapter: Arc::clone(&self.adapter),
            clock: Arc::clone(&self.clock),
            dispatcher: Arc::clone(&self.dispatcher),
            memo: Mutex::new(None),
        }
    }

    /// Re-binds a wire shape to this provider.
    pub fn import(&self, wire: &SemaphoreHandleWire) -> Result<Semaphore, WireError> {
        check_version(wire.version)?;
        Ok(self.create_with(
            &wire.key,
            wire.limit,
            SemaphoreOptions {
                slot_id: Some(wire.slot_id.clone()),
                ttl: wire.ttl_ms.map(TimeSpan::from_millis),
            },
        ))
    }
}

/// Handle for one slot of a counting semaphore.
pub struct Semaphore {
    key: Key,
    slot_id: String,
    limit: u32,
    ttl: Option<TimeSpan>,
    blocking: BlockingOptions,
    refresh_ttl: TimeSpan,
    adapter: Arc<dyn SemaphoreAdapter>,
    clock: Arc<dyn ClockSource>,
    dispatcher: Arc<dyn EventDispatcher>,
    /// Local expiration memo; see [`crate::lock::Lock`] for the shape.
    memo: Mutex<Option<Option<u64>>>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("key", &self.key)
            .field("slot_id", &self.slot_id)
            .field("limit", &self.limit)
            .field("ttl", &self.ttl)
            .field("blocking", &self.blocking)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("memo", &self.memo)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    /// The resolved key this handle addresses.
    #[must_use]
    pub fn key(&self) -> &str {
        self.key.resolved()
    }

    /// The slot identity this handle acquires and releases.
    #[must_use]
    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    /// The capacity this handle requests on first insert.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Attempts to take a slot. One adapter round-trip.
    ///
    /// Idempotent per slot id; returns `false` only when capacity is
    /// exhausted under the enforced limit.
    pub async fn acquire(&self) -> Result<bool, SemaphoreError> {
        let request = SemaphoreAcquire {
            key: self.key.namespaced(),
            slot_id: &self.slot_id,
            limit: self.limit,
            ttl: self.ttl,
        };
        match self.adapter.acquire(request).await {
            Ok(true) => {
                let now = self.clock.now_ms();
                *self.memo.lock() = Some(time::expiry_from(self.ttl, now));
                debug!(key = %self.key(), slot_id = %self.slot_id, "semaphore slot acquired");
                self.dispatcher.dispatch(
                    SemaphoreEvent::Acquired {
                        key: self.key().to_string(),
                        slot_id: self.slot_id.clone(),
                        ttl: self.ttl,
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SemaphoreEvent::LimitReached {
                        key: self.key().to_string(),
                        slot_id: self.slot_id.clone(),
                        limit: self.limit,
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(SemaphoreError::UnableToAcquire {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Like [`Semaphore::acquire`] but exhausted capacity is an error.
    pub async fn acquire_or_fail(&self) -> Result<(), SemaphoreError> {
        if self.acquire().await? {
            Ok(())
        } else {
            Err(SemaphoreError::LimitReached {
                key: self.key().to_string(),
                slot_id: self.slot_id.clone(),
            })
        }
    }

    /// Retries [`Semaphore::acquire`] until a slot frees up or the budget
    /// runs out. Uses the provider's blocking defaults.
    pub async fn acquire_blocking(&self) -> Result<bool, SemaphoreError> {
        self.acquire_blocking_with(self.blocking).await
    }

    /// Blocking acquire with explicit timing.
    pub async fn acquire_blocking_with(
        &self,
        options: BlockingOptions,
    ) -> Result<bool, SemaphoreError> {
        let deadline = tokio::time::Instant::now() + options.time.to_duration();
        loop {
            if self.acquire().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(options.interval.to_duration()).await;
        }
    }

    /// Like [`Semaphore::acquire_blocking`] but a timeout is an error.
    pub async fn acquire_blocking_or_fail(&self) -> Result<(), SemaphoreError> {
        self.acquire_blocking_or_fail_with(self.blocking).await
    }

    /// Like [`Semaphore::acquire_blocking_with`] but a timeout is an error.
    pub async fn acquire_blocking_or_fail_with(
        &self,
        options: BlockingOptions,
    ) -> Result<(), SemaphoreError> {
        if self.acquire_blocking_with(options).await? {
            Ok(())
        } else {
            Err(SemaphoreError::AcquireTimeout {
                key: self.key().to_string(),
                slot_id: self.slot_id.clone(),
                waited_ms: options.time.as_millis(),
            })
        }
    }

    /// Releases this handle's slot. Other slots are never touched.
    ///
    /// Returns `false` when the slot already expired or was never held.
    pub async fn release(&self) -> Result<bool, SemaphoreError> {
        match self
            .adapter
            .release(self.key.namespaced(), &self.slot_id)
            .await
        {
            Ok(true) => {
                *self.memo.lock() = None;
                debug!(key = %self.key(), slot_id = %self.slot_id, "semaphore slot released");
                self.dispatcher.dispatch(
                    SemaphoreEvent::Released {
                        key: self.key().to_string(),
                        slot_id: self.slot_id.clone(),
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SemaphoreEvent::FailedRelease {
                        key: self.key().to_string(),
                        slot_id: self.slot_id.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(SemaphoreError::UnableToRelease {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Like [`Semaphore::release`] but a missing slot is an error.
    pub async fn release_or_fail(&self) -> Result<(), SemaphoreError> {
        if self.release().await? {
            Ok(())
        } else {
            Err(SemaphoreError::FailedRelease {
                key: self.key().to_string(),
                slot_id: self.slot_id.clone(),
            })
        }
    }

    /// Clears the whole record. Returns whether at least one unexpired
    /// slot existed.
    pub async fn force_release_all(&self) -> Result<bool, SemaphoreError> {
        match self.adapter.force_release_all(self.key.namespaced()).await {
            Ok(has_released) => {
                *self.memo.lock() = None;
                debug!(key = %self.key(), has_released, "semaphore force-released");
                self.dispatcher.dispatch(
                    SemaphoreEvent::AllForceReleased {
                        key: self.key().to_string(),
                        has_released,
                    }
                    .into(),
                );
                Ok(has_released)
            }
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(SemaphoreError::UnableToRelease {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Extends this slot's expiration by the provider's default refresh
    /// TTL.
    pub async fn refresh(&self) -> Result<bool, SemaphoreError> {
        self.refresh_with(self.refresh_ttl).await
    }

    /// Extends this slot's expiration by `ttl` from now.
    ///
    /// Returns `false` when the slot is not held or never expires.
    pub async fn refresh_with(&self, ttl: TimeSpan) -> Result<bool, SemaphoreError> {
        match self
            .adapter
            .refresh(self.key.namespaced(), &self.slot_id, ttl)
            .await
        {
            Ok(true) => {
                let now = self.clock.now_ms();
                *self.memo.lock() = Some(Some(ttl.end_from(now)));
                debug!(key = %self.key(), slot_id = %self.slot_id, %ttl, "semaphore slot refreshed");
                self.dispatcher.dispatch(
                    SemaphoreEvent::Refreshed {
                        key: self.key().to_string(),
                        slot_id: self.slot_id.clone(),
                        ttl,
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SemaphoreEvent::FailedRefresh {
                        key: self.key().to_string(),
                        slot_id: self.slot_id.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(SemaphoreError::Unexpected {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Like [`Semaphore::refresh`] but a refused refresh is an error.
    pub async fn refresh_or_fail(&self) -> Result<(), SemaphoreError> {
        if self.refresh().await? {
            Ok(())
        } else {
            Err(SemaphoreError::FailedRefresh {
                key: self.key().to_string(),
                slot_id: self.slot_id.clone(),
            })
        }
    }

    /// Best-effort local view: whether the memoized slot expiration has
    /// passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(*self.memo.lock(), Some(Some(end)) if end <= self.clock.now_ms())
    }

    /// Best-effort local view: whether this handle believes it holds a
    /// slot.
    #[must_use]
    pub fn is_acquired(&self) -> bool {
        match *self.memo.lock() {
            Some(None) => true,
            Some(Some(end)) => end > self.clock.now_ms(),
            None => false,
        }
    }

    /// Remaining slot lifetime derived from the memo.
    #[must_use]
    pub fn get_remaining_time(&self) -> Option<TimeSpan> {
        match *self.memo.lock() {
            Some(Some(end)) => Some(TimeSpan::from_millis(
                end.saturating_sub(self.clock.now_ms()),
            )),
            _ => None,
        }
    }

    /// Authoritative structured view, interpreted relative to this
    /// handle's slot.
    pub async fn get_state(&self) -> Result<SemaphoreStateView, SemaphoreError> {
        let record = match self.adapter.get_state(self.key.namespaced()).await {
            Ok(record) => record,
            Err(source) => {
                self.dispatch_unexpected(&source);
                return Err(SemaphoreError::Unexpected {
                    key: self.key().to_string(),
                    source,
                });
            }
        };

        let now = self.clock.now_ms();
        let memo_expired = self.is_expired();
        let view = match record {
            Some(record) => {
                if let Some(expires) = record.slots.get(&self.slot_id) {
                    SemaphoreStateView::Acquired {
                        limit: record.limit,
                        acquired_slots: record.live_slot_ids(now),
                        acquired_slots_count: record.live_slot_count(now),
                        free_slots_count: record.free_slot_count(now),
                        remaining_time: time::remaining(*expires, now),
                    }
                } else if record.live_slot_count(now) >= record.limit {
                    SemaphoreStateView::LimitReached {
                        limit: record.limit,
                        acquired_slots: record.live_slot_ids(now),
                    }
                } else if memo_expired {
                    SemaphoreStateView::Expired
                } else {
                    SemaphoreStateView::Unacquired {
                        limit: record.limit,
                        acquired_slots_count: record.live_slot_count(now),
                        free_slots_count: record.free_slot_count(now),
                    }
                }
            }
            None if memo_expired => SemaphoreStateView::Expired,
            None => SemaphoreStateView::Unacquired {
                limit: self.limit,
                acquired_slots_count: 0,
                free_slots_count: self.limit,
            },
        };
        Ok(view)
    }

    /// Acquires a slot, runs `body`, and always attempts release
    /// afterwards -- also when `body` panics.
    pub async fn run<T, F, Fut>(&self, body: F) -> Result<T, SemaphoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire().await? {
            return Err(SemaphoreError::LimitReached {
                key: self.key().to_string(),
                slot_id: self.slot_id.clone(),
            });
        }
        self.run_released(body).await
    }

    /// [`Semaphore::run`] with a blocking acquire and explicit timing.
    pub async fn run_blocking_with<T, F, Fut>(
        &self,
        body: F,
        options: BlockingOptions,
    ) -> Result<T, SemaphoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire_blocking_or_fail_with(options).await?;
        self.run_released(body).await
    }

    /// [`Semaphore::run`] with a blocking acquire and the provider's
    /// timing.
    pub async fn run_blocking<T, F, Fut>(&self, body: F) -> Result<T, SemaphoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_blocking_with(body, self.blocking).await
    }

    async fn run_released<T, F, Fut>(&self, body: F) -> Result<T, SemaphoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(body()).catch_unwind().await;
        let released = self.release().await;
        match outcome {
            Ok(value) => {
                released?;
                Ok(value)
            }
            Err(panic) => {
                if let Err(release_error) = released {
                    warn!(key = %self.key(), error = %release_error,
                        "release failed while unwinding");
                }
                resume_unwind(panic)
            }
        }
    }

    /// Exports the wire shape of this handle. The memo is not serialized.
    #[must_use]
    pub fn export(&self) -> SemaphoreHandleWire {
        SemaphoreHandleWire {
            version: WIRE_VERSION,
            key: self.key().to_string(),
            slot_id: self.slot_id.clone(),
            limit: self.limit,
            ttl_ms: self.ttl.map(TimeSpan::as_millis),
        }
    }

    fn dispatch_unexpected(&self, source: &anyhow::Error) {
        warn!(key = %self.key(), slot_id = %self.slot_id, error = %source,
            "semaphore adapter fault");
        self.dispatcher.dispatch(
            SemaphoreEvent::UnexpectedError {
                key: self.key().to_string(),
                slot_id: self.slot_id.clone(),
                message: source.to_string(),
            }
            .into(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemorySemaphoreAdapter;
    use crate::event::{CoordinationEvent, MemoryEventDispatcher};
    use crate::time::ManualClock;

    struct Fixture {
        provider: SemaphoreProvider,
        clock: Arc<ManualClock>,
        events: Arc<MemoryEventDispatcher>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let events = Arc::new(MemoryEventDispatcher::new());
        let provider = SemaphoreProvider::new(
            SemaphoreBackend::Direct(Arc::new(MemorySemaphoreAdapter::new(
                Arc::clone(&clock) as Arc<dyn ClockSource>
            ))),
            SemaphoreProviderOptions {
                clock: Arc::clone(&clock) as Arc<dyn ClockSource>,
                event_dispatcher: Arc::clone(&events) as Arc<dyn EventDispatcher>,
                ..SemaphoreProviderOptions::default()
            },
        );
        Fixture {
            provider,
            clock,
            events,
        }
    }

    fn slot(fx: &Fixture, key: &str, slot_id: &str, limit: u32, ttl: Option<TimeSpan>) -> Semaphore {
        fx.provider.create_with(
            key,
            limit,
            SemaphoreOptions {
                slot_id: Some(slot_id.to_string()),
                ttl,
            },
        )
    }

    #[tokio::test]
    async fn capacity_bound_with_idempotent_reacquire() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 2, None);
        let s2 = slot(&fx, "pool", "s2", 2, None);
        let s3 = slot(&fx, "pool", "s3", 2, None);

        assert!(s1.acquire().await.unwrap());
        assert!(s1.acquire().await.unwrap());
        assert!(s2.acquire().await.unwrap());
        assert!(!s3.acquire().await.unwrap());

        assert!(s1.release().await.unwrap());
        assert!(s3.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn acquire_or_fail_reports_limit() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 1, None);
        let s2 = slot(&fx, "pool", "s2", 1, None);

        s1.acquire_or_fail().await.unwrap();
        let err = s2.acquire_or_fail().await.unwrap_err();
        assert!(matches!(
            err,
            SemaphoreError::LimitReached { key, slot_id } if key == "pool" && slot_id == "s2"
        ));

        let events = fx.events.take();
        assert!(matches!(
            events.last(),
            Some(CoordinationEvent::Semaphore(SemaphoreEvent::LimitReached {
                limit: 1,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn release_of_missing_slot_fails_typed() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 2, None);

        assert!(!s1.release().await.unwrap());
        let err = s1.release_or_fail().await.unwrap_err();
        assert!(matches!(err, SemaphoreError::FailedRelease { .. }));
    }

    #[tokio::test]
    async fn expired_slot_release_returns_false() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 2, Some(TimeSpan::from_millis(30)));

        s1.acquire().await.unwrap();
        fx.clock.advance(TimeSpan::from_millis(31));

        assert!(!s1.release().await.unwrap());
        assert!(s1.is_expired());
    }

    #[tokio::test]
    async fn force_release_all_reports_flag_in_event() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 2, None);
        let s2 = slot(&fx, "pool", "s2", 2, None);

        s1.acquire().await.unwrap();
        s2.acquire().await.unwrap();

        assert!(s1.force_release_all().await.unwrap());
        assert!(!s1.force_release_all().await.unwrap());

        let flags: Vec<bool> = fx
            .events
            .take()
            .into_iter()
            .filter_map(|event| match event {
                CoordinationEvent::Semaphore(SemaphoreEvent::AllForceReleased {
                    has_released,
                    ..
                }) => Some(has_released),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![true, false]);

        assert!(s2.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn refresh_extends_only_expirable_held_slots() {
        let fx = fixture();
        let expirable = slot(&fx, "pool", "s1", 2, Some(TimeSpan::from_millis(50)));
        let unexpireable = slot(&fx, "pool", "s2", 2, None);

        expirable.acquire().await.unwrap();
        unexpireable.acquire().await.unwrap();

        assert!(!unexpireable.refresh().await.unwrap());
        let err = unexpireable.refresh_or_fail().await.unwrap_err();
        assert!(matches!(err, SemaphoreError::FailedRefresh { .. }));

        fx.clock.advance(TimeSpan::from_millis(20));
        assert!(expirable.refresh_with(TimeSpan::from_millis(100)).await.unwrap());
        assert_eq!(
            expirable.get_remaining_time(),
            Some(TimeSpan::from_millis(100))
        );
    }

    #[tokio::test]
    async fn state_view_walks_all_variants() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 2, None);
        let s2 = slot(&fx, "pool", "s2", 2, None);
        let s3 = slot(&fx, "pool", "s3", 2, None);

        assert_eq!(
            s1.get_state().await.unwrap(),
            SemaphoreStateView::Unacquired {
                limit: 2,
                acquired_slots_count: 0,
                free_slots_count: 2,
            }
        );

        s1.acquire().await.unwrap();
        assert_eq!(
            s1.get_state().await.unwrap(),
            SemaphoreStateView::Acquired {
                limit: 2,
                acquired_slots: vec!["s1".to_string()],
                acquired_slots_count: 1,
                free_slots_count: 1,
                remaining_time: None,
            }
        );

        s2.acquire().await.unwrap();
        assert_eq!(
            s3.get_state().await.unwrap(),
            SemaphoreStateView::LimitReached {
                limit: 2,
                acquired_slots: vec!["s1".to_string(), "s2".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn state_view_reports_expired_slot() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 2, Some(TimeSpan::from_millis(30)));

        s1.acquire().await.unwrap();
        fx.clock.advance(TimeSpan::from_millis(31));

        assert_eq!(s1.get_state().await.unwrap(), SemaphoreStateView::Expired);
    }

    #[tokio::test]
    async fn limit_frozen_until_record_drains() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 2, None);
        let s2 = slot(&fx, "pool", "s2", 3, None);
        let s3 = slot(&fx, "pool", "s3", 3, None);

        assert!(s1.acquire().await.unwrap());
        assert!(s2.acquire().await.unwrap());
        assert!(!s3.acquire().await.unwrap());

        s1.release().await.unwrap();
        s2.release().await.unwrap();

        // Drained: the next acquire re-records the limit.
        assert!(s3.acquire().await.unwrap());
        match s3.get_state().await.unwrap() {
            SemaphoreStateView::Acquired { limit, .. } => assert_eq!(limit, 3),
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_waits_for_free_slot() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 1, None);
        s1.acquire().await.unwrap();

        let provider = fx.provider.clone();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(80)).await;
            provider
                .create_with(
                    "pool",
                    1,
                    SemaphoreOptions {
                        slot_id: Some("s1".to_string()),
                        ttl: None,
                    },
                )
                .release()
                .await
                .unwrap();
        });

        let s2 = slot(&fx, "pool", "s2", 1, None);
        assert!(s2
            .acquire_blocking_with(BlockingOptions {
                time: TimeSpan::from_secs(1),
                interval: TimeSpan::from_millis(10),
            })
            .await
            .unwrap());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn run_frees_the_slot_after_body() {
        let fx = fixture();
        let s1 = slot(&fx, "pool", "s1", 1, None);
        let s2 = slot(&fx, "pool", "s2", 1, None);

        let value = s1.run(|| async { "done" }).await.unwrap();
        assert_eq!(value, "done");
        assert!(s2.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn run_releases_when_body_panics() {
        let fx = fixture();
        let provider = fx.provider.clone();

        let panicked = tokio::spawn(async move {
            let semaphore = provider.create_with(
                "pool",
                1,
                SemaphoreOptions {
                    slot_id: Some("s1".to_string()),
                    ttl: None,
                },
            );
            semaphore.run::<(), _, _>(|| async { panic!("boom") }).await
        })
        .await;
        assert!(panicked.is_err());

        let s2 = slot(&fx, "pool", "s2", 1, None);
        assert!(s2.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn export_import_addresses_same_slot() {
        let fx = fixture();
        let original = slot(&fx, "pool", "s1", 3, Some(TimeSpan::from_secs(30)));
        original.acquire().await.unwrap();

        let wire = original.export();
        assert_eq!(wire.limit, 3);
        assert_eq!(wire.ttl_ms, Some(30_000));

        let imported = fx.provider.import(&wire).unwrap();
        assert_eq!(imported.slot_id(), "s1");
        assert!(imported.release().await.unwrap());
        assert_eq!(
            original.get_state().await.unwrap(),
            SemaphoreStateView::Unacquired {
                limit: 3,
                acquired_slots_count: 0,
                free_slots_count: 3,
            }
        );
    }

    #[tokio::test]
    async fn import_rejects_unknown_version() {
        let fx = fixture();
        let mut wire = slot(&fx, "pool", "s1", 2, None).export();
        wire.version = 7;
        assert!(matches!(
            fx.provider.import(&wire).unwrap_err(),
            WireError::UnsupportedVersion { found: 7 }
        ));
    }
}
