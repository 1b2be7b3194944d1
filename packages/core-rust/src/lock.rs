//! Exclusive lock primitive.
//!
//! A [`LockProvider`] holds the normalized adapter plus defaults and mints
//! cheap [`Lock`] handles bound to a user key. Each operation delegates to
//! one atomic adapter call, interprets the boolean outcome, dispatches an
//! event, and updates the handle-local expiration memo on success paths.
//!
//! From one key's perspective the state machine is `Free -> Held(owner,
//! expiry) -> Free`. Re-entry by the same owner stays in `Held` without
//! resetting the expiry; lazy-expiry transitions are observed by the next
//! operation, no background sweeper required.

use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::adapter::{LockAdapter, LockBackend, LockRecord};
use crate::event::{EventDispatcher, LockEvent, NullEventDispatcher};
use crate::key::{Key, Namespace};
use crate::time::{self, ClockSource, SystemClock, TimeSpan};
use crate::wire::{check_version, LockHandleWire, WireError, WIRE_VERSION};

/// Default TTL for locks minted by [`LockProvider::create`].
pub const DEFAULT_LOCK_TTL: TimeSpan = TimeSpan::from_mins(5);

/// Timing for blocking acquisition loops.
///
/// The loop retries `acquire` every `interval` until it succeeds or the
/// wall-clock budget `time` runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingOptions {
    /// Total wall-clock budget.
    pub time: TimeSpan,
    /// Sleep between attempts.
    pub interval: TimeSpan,
}

impl Default for BlockingOptions {
    fn default() -> Self {
        Self {
            time: TimeSpan::from_mins(1),
            interval: TimeSpan::from_millis(50),
        }
    }
}

/// Errors surfaced by the lock primitive.
///
/// Contention and ownership failures are ordinarily reported as boolean
/// results; the `*_or_fail` variants turn them into the typed errors here.
/// Adapter faults always surface typed and additionally dispatch an
/// [`LockEvent::UnexpectedError`] event.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock \"{key}\" is already acquired by another owner")]
    KeyAlreadyAcquired { key: String, owner: String },
    #[error("lock \"{key}\" was not acquired within {waited_ms}ms")]
    AcquireTimeout {
        key: String,
        owner: String,
        waited_ms: u64,
    },
    #[error("release of lock \"{key}\" refused: not held by \"{owner}\"")]
    UnownedRelease { key: String, owner: String },
    #[error("refresh of lock \"{key}\" refused: not held by \"{owner}\" or unexpireable")]
    UnownedRefresh { key: String, owner: String },
    #[error("adapter fault while acquiring lock \"{key}\"")]
    UnableToAcquire {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("adapter fault while releasing lock \"{key}\"")]
    UnableToRelease {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("adapter fault while operating on lock \"{key}\"")]
    Unexpected {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Configuration for a [`LockProvider`].
pub struct LockProviderOptions {
    /// Prefix under which all of this provider's keys are stored.
    pub namespace: Namespace,
    /// TTL given to handles minted by [`LockProvider::create`].
    pub default_ttl: Option<TimeSpan>,
    /// Blocking-loop timing used when a call does not override it.
    pub default_blocking: BlockingOptions,
    /// TTL applied by [`Lock::refresh`].
    pub default_refresh_ttl: TimeSpan,
    /// Clock used for the local expiration memo.
    pub clock: Arc<dyn ClockSource>,
    /// Receives every event the minted handles emit.
    pub event_dispatcher: Arc<dyn EventDispatcher>,
}

impl Default for LockProviderOptions {
    fn default() -> Self {
        Self {
            namespace: Namespace::new("holdfast").group("lock"),
            default_ttl: Some(DEFAULT_LOCK_TTL),
            default_blocking: BlockingOptions::default(),
            default_refresh_ttl: DEFAULT_LOCK_TTL,
            clock: Arc::new(SystemClock),
            event_dispatcher: Arc::new(NullEventDispatcher),
        }
    }
}

/// Explicit settings for [`LockProvider::create_with`].
///
/// Unlike [`LockProvider::create`], nothing here falls back to provider
/// defaults: `owner: None` generates an identity, and `ttl: None` mints an
/// unexpireable lock.
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Identity to compare on release/refresh; generated when `None`.
    pub owner: Option<String>,
    /// Explicit TTL; `None` means the lock never expires.
    pub ttl: Option<TimeSpan>,
}

/// Factory for [`Lock`] handles sharing one adapter and namespace.
#[derive(Clone)]
pub struct LockProvider {
    adapter: Arc<dyn LockAdapter>,
    namespace: Namespace,
    default_ttl: Option<TimeSpan>,
    default_blocking: BlockingOptions,
    default_refresh_ttl: TimeSpan,
    clock: Arc<dyn ClockSource>,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl LockProvider {
    /// Creates a provider over `backend`, normalizing database-flavor
    /// adapters through a bridge.
    #[must_use]
    pub fn new(backend: LockBackend, options: LockProviderOptions) -> Self {
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

    /// Mints a handle with a generated owner and the provider default TTL.
    #[must_use]
    pub fn create(&self, key: &str) -> Lock {
        self.create_with(
            key,
            LockOptions {
                owner: None,
                ttl: self.default_ttl,
            },
        )
    }

    /// Mints a handle with explicit settings; see [`LockOptions`].
    #[must_use]
    pub fn create_with(&self, key: &str, options: LockOptions) -> Lock {
        Lock {
            key: self.namespace.key(key),
            owner: options
                .owner
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
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
    ///
    /// When this provider shares the exporter's adapter and namespace, the
    /// imported handle addresses the same record.
    pub fn import(&self, wire: &LockHandleWire) -> Result<Lock, WireError> {
        check_version(wire.version)?;
        Ok(self.create_with(
            &wire.key,
            LockOptions {
                owner: Some(wire.owner.clone()),
                ttl: wire.ttl_ms.map(TimeSpan::from_millis),
            },
        ))
    }
}

/// Handle for one key's exclusive lock.
///
/// Cheap to create and discard; owns no persistent state. The local
/// expiration memo behind [`Lock::is_locked`] / [`Lock::is_expired`] is a
/// best-effort view updated on this handle's own success paths --
/// authoritative state always comes from [`Lock::get_state`].
pub struct Lock {
    key: Key,
    owner: String,
    ttl: Option<TimeSpan>,
    blocking: BlockingOptions,
    refresh_ttl: TimeSpan,
    adapter: Arc<dyn LockAdapter>,
    clock: Arc<dyn ClockSource>,
    dispatcher: Arc<dyn EventDispatcher>,
    /// `None` = nothing known; `Some(None)` = held, unexpireable;
    /// `Some(Some(ms))` = held until `ms`.
    memo: Mutex<Option<Option<u64>>>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("ttl", &self.ttl)
            .field("blocking", &self.blocking)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("memo", &self.memo)
            .finish_non_exhaustive()
    }
}

impl Lock {
    /// The resolved key this handle addresses.
    #[must_use]
    pub fn key(&self) -> &str {
        self.key.resolved()
    }

    /// The identity compared on release and refresh.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The TTL applied on acquire; `None` means unexpireable.
    #[must_use]
    pub fn ttl(&self) -> Option<TimeSpan> {
        self.ttl
    }

    /// Attempts to take the lock. One adapter round-trip.
    ///
    /// Returns `false` when another owner holds the key. Re-acquire by
    /// this owner succeeds without extending the expiration.
    pub async fn acquire(&self) -> Result<bool, LockError> {
        match self
            .adapter
            .acquire(self.key.namespaced(), &self.owner, self.ttl)
            .await
        {
            Ok(true) => {
                let now = self.clock.now_ms();
                *self.memo.lock() = Some(time::expiry_from(self.ttl, now));
                debug!(key = %self.key(), owner = %self.owner, "lock acquired");
                self.dispatcher.dispatch(
                    LockEvent::Acquired {
                        key: self.key().to_string(),
                        owner: self.owner.clone(),
                        ttl: self.ttl,
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    LockEvent::NotAvailable {
                        key: self.key().to_string(),
                        owner: self.owner.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(LockError::UnableToAcquire {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Like [`Lock::acquire`] but contention is an error.
    pub async fn acquire_or_fail(&self) -> Result<(), LockError> {
        if self.acquire().await? {
            Ok(())
        } else {
            Err(LockError::KeyAlreadyAcquired {
                key: self.key().to_string(),
                owner: self.owner.clone(),
            })
        }
    }

    /// Retries [`Lock::acquire`] on an interval until it succeeds or the
    /// wall-clock budget runs out. Uses the provider's blocking defaults.
    pub async fn acquire_blocking(&self) -> Result<bool, LockError> {
        self.acquire_blocking_with(self.blocking).await
    }

    /// Blocking acquire with explicit timing.
    ///
    /// Contention is retried; an adapter fault aborts the loop.
    pub async fn acquire_blocking_with(
        &self,
        options: BlockingOptions,
    ) -> Result<bool, LockError> {
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

    /// Like [`Lock::acquire_blocking`] but a timeout is an error.
    pub async fn acquire_blocking_or_fail(&self) -> Result<(), LockError> {
        self.acquire_blocking_or_fail_with(self.blocking).await
    }

    /// Like [`Lock::acquire_blocking_with`] but a timeout is an error.
    pub async fn acquire_blocking_or_fail_with(
        &self,
        options: BlockingOptions,
    ) -> Result<(), LockError> {
        if self.acquire_blocking_with(options).await? {
            Ok(())
        } else {
            Err(LockError::AcquireTimeout {
                key: self.key().to_string(),
                owner: self.owner.clone(),
                waited_ms: options.time.as_millis(),
            })
        }
    }

    /// Releases the lock if this owner holds it.
    ///
    /// Returns `false` when the lock is expired, absent, or held by
    /// someone else; the record is left intact in the latter case.
    pub async fn release(&self) -> Result<bool, LockError> {
        match self
            .adapter
            .release(self.key.namespaced(), &self.owner)
            .await
        {
            Ok(true) => {
                *self.memo.lock() = None;
                debug!(key = %self.key(), owner = %self.owner, "lock released");
                self.dispatcher.dispatch(
                    LockEvent::Released {
                        key: self.key().to_string(),
                        owner: self.owner.clone(),
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    LockEvent::UnownedReleaseTry {
                        key: self.key().to_string(),
                        owner: self.owner.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(LockError::UnableToRelease {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Like [`Lock::release`] but an unowned release is an error.
    pub async fn release_or_fail(&self) -> Result<(), LockError> {
        if self.release().await? {
            Ok(())
        } else {
            Err(LockError::UnownedRelease {
                key: self.key().to_string(),
                owner: self.owner.clone(),
            })
        }
    }

    /// Removes the lock regardless of owner. Returns whether an unexpired
    /// record was removed.
    pub async fn force_release(&self) -> Result<bool, LockError> {
        match self.adapter.force_release(self.key.namespaced()).await {
            Ok(released) => {
                *self.memo.lock() = None;
                if released {
                    debug!(key = %self.key(), "lock force-released");
                    self.dispatcher.dispatch(
                        LockEvent::ForceReleased {
                            key: self.key().to_string(),
                        }
                        .into(),
                    );
                }
                Ok(released)
            }
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(LockError::UnableToRelease {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Extends the expiration by the provider's default refresh TTL.
    pub async fn refresh(&self) -> Result<bool, LockError> {
        self.refresh_with(self.refresh_ttl).await
    }

    /// Extends the expiration by `ttl` from now.
    ///
    /// Returns `false` when this owner does not hold the lock or the lock
    /// is unexpireable (a null-TTL lock cannot be refreshed).
    pub async fn refresh_with(&self, ttl: TimeSpan) -> Result<bool, LockError> {
        match self
            .adapter
            .refresh(self.key.namespaced(), &self.owner, ttl)
            .await
        {
            Ok(true) => {
                let now = self.clock.now_ms();
                *self.memo.lock() = Some(Some(ttl.end_from(now)));
                debug!(key = %self.key(), owner = %self.owner, %ttl, "lock refreshed");
                self.dispatcher.dispatch(
                    LockEvent::Refreshed {
                        key: self.key().to_string(),
                        owner: self.owner.clone(),
                        ttl,
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    LockEvent::UnownedRefreshTry {
                        key: self.key().to_string(),
                        owner: self.owner.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(LockError::Unexpected {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Like [`Lock::refresh`] but a refused refresh is an error.
    pub async fn refresh_or_fail(&self) -> Result<(), LockError> {
        if self.refresh().await? {
            Ok(())
        } else {
            Err(LockError::UnownedRefresh {
                key: self.key().to_string(),
                owner: self.owner.clone(),
            })
        }
    }

    /// Best-effort local view: whether the memoized expiration has passed.
    ///
    /// Consults only this handle's memo, never the adapter.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(*self.memo.lock(), Some(Some(end)) if end <= self.clock.now_ms())
    }

    /// Best-effort local view: whether this handle believes it holds the
    /// lock. Authoritative state requires [`Lock::get_state`].
    #[must_use]
    pub fn is_locked(&self) -> bool {
        match *self.memo.lock() {
            Some(None) => true,
            Some(Some(end)) => end > self.clock.now_ms(),
            None => false,
        }
    }

    /// Remaining lifetime derived from the memo; `None` when unexpireable
    /// or nothing is memoized.
    #[must_use]
    pub fn get_remaining_time(&self) -> Option<TimeSpan> {
        match *self.memo.lock() {
            Some(Some(end)) => Some(TimeSpan::from_millis(
                end.saturating_sub(self.clock.now_ms()),
            )),
            _ => None,
        }
    }

    /// Authoritative record from the adapter, `None` if absent or expired.
    pub async fn get_state(&self) -> Result<Option<LockRecord>, LockError> {
        match self.adapter.get_state(self.key.namespaced()).await {
            Ok(state) => Ok(state),
            Err(source) => {
                self.dispatch_unexpected(&source);
                Err(LockError::Unexpected {
                    key: self.key().to_string(),
                    source,
                })
            }
        }
    }

    /// Acquires, runs `body`, and always attempts release afterwards --
    /// also when `body` panics, in which case the panic is resumed after
    /// the release attempt.
    ///
    /// Contention is [`LockError::KeyAlreadyAcquired`].
    pub async fn run<T, F, Fut>(&self, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire().await? {
            return Err(LockError::KeyAlreadyAcquired {
                key: self.key().to_string(),
                owner: self.owner.clone(),
            });
        }
        self.run_released(body).await
    }

    /// [`Lock::run`] with a blocking acquire and the provider's timing.
    pub async fn run_blocking<T, F, Fut>(&self, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_blocking_with(body, self.blocking).await
    }

    /// [`Lock::run`] with a blocking acquire and explicit timing.
    pub async fn run_blocking_with<T, F, Fut>(
        &self,
        body: F,
        options: BlockingOptions,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire_blocking_or_fail_with(options).await?;
        self.run_released(body).await
    }

    /// Runs `body` under an already-held lock and releases afterwards.
    async fn run_released<T, F, Fut>(&self, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(body()).catch_unwind().await;
        let released = self.release().await;
        match outcome {
            Ok(value) => {
                // A false release (the lock expired mid-run) is not an
                // error; an adapter fault is.
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
    pub fn export(&self) -> LockHandleWire {
        LockHandleWire {
            version: WIRE_VERSION,
            key: self.key().to_string(),
            owner: self.owner.clone(),
            ttl_ms: self.ttl.map(TimeSpan::as_millis),
        }
    }

    fn dispatch_unexpected(&self, source: &anyhow::Error) {
        warn!(key = %self.key(), owner = %self.owner, error = %source, "lock adapter fault");
        self.dispatcher.dispatch(
            LockEvent::UnexpectedError {
                key: self.key().to_string(),
                owner: self.owner.clone(),
                message: source.to_string(),
            }
            .into(),
        );
    }
}
