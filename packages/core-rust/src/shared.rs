//! Shared (reader/writer) lock primitive.
//!
//! Two mutually exclusive modes share one key: *writer* (exclusive, like
//! the lock) and *reader* (bounded, like the semaphore). Every operation
//! is namespaced by intent, and the central correctness property is mode
//! disjointness: an operation against the inactive mode returns false and
//! leaves state untouched. Transitions happen only through a full release
//! of the active side -- there is no upgrade or downgrade primitive.

use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::adapter::{ReaderAcquire, SharedLockAdapter, SharedLockState};
use crate::event::{EventDispatcher, NullEventDispatcher, SharedLockEvent};
use crate::key::{Key, Namespace};
use crate::lock::BlockingOptions;
use crate::time::TimeSpan;
use crate::wire::{check_version, SharedLockHandleWire, WireError, WIRE_VERSION};

/// Default TTL for handles minted by [`SharedLockProvider::create`].
pub const DEFAULT_SHARED_LOCK_TTL: TimeSpan = TimeSpan::from_mins(5);

/// Errors surfaced by the shared-lock primitive.
#[derive(Debug, thiserror::Error)]
pub enum SharedLockError {
    #[error("shared lock \"{key}\" writer side is not available for \"{owner}\"")]
    WriterNotAvailable { key: String, owner: String },
    #[error("shared lock \"{key}\" has no free reader slot for \"{lock_id}\"")]
    ReaderLimitReached { key: String, lock_id: String },
    #[error("shared lock \"{key}\" was not acquired within {waited_ms}ms")]
    AcquireTimeout {
        key: String,
        lock_id: String,
        waited_ms: u64,
    },
    #[error("writer release of shared lock \"{key}\" refused for \"{owner}\"")]
    UnownedWriterRelease { key: String, owner: String },
    #[error("reader release of shared lock \"{key}\" refused for \"{lock_id}\"")]
    FailedReaderRelease { key: String, lock_id: String },
    #[error("writer refresh of shared lock \"{key}\" refused for \"{owner}\"")]
    UnownedWriterRefresh { key: String, owner: String },
    #[error("reader refresh of shared lock \"{key}\" refused for \"{lock_id}\"")]
    FailedReaderRefresh { key: String, lock_id: String },
    #[error("adapter fault while operating on shared lock \"{key}\"")]
    Unexpected {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Configuration for a [`SharedLockProvider`].
///
/// Expiry is interpreted by the adapter's clock, so no clock is injected
/// here and the handles keep no local expiration memo -- authoritative
/// state is always [`SharedLock::get_state`].
pub struct SharedLockProviderOptions {
    pub namespace: Namespace,
    /// TTL given to handles minted by [`SharedLockProvider::create`].
    pub default_ttl: Option<TimeSpan>,
    pub default_blocking: BlockingOptions,
    /// TTL applied by the no-argument refresh methods.
    pub default_refresh_ttl: TimeSpan,
    pub event_dispatcher: Arc<dyn EventDispatcher>,
}

impl Default for SharedLockProviderOptions {
    fn default() -> Self {
        Self {
            namespace: Namespace::new("holdfast").group("shared"),
            default_ttl: Some(DEFAULT_SHARED_LOCK_TTL),
            default_blocking: BlockingOptions::default(),
            default_refresh_ttl: DEFAULT_SHARED_LOCK_TTL,
            event_dispatcher: Arc::new(NullEventDispatcher),
        }
    }
}

/// Explicit settings for [`SharedLockProvider::create_with`].
#[derive(Debug, Clone, Default)]
pub struct SharedLockOptions {
    /// Identity used as writer owner and reader slot id; generated when
    /// `None`.
    pub lock_id: Option<String>,
    /// Explicit TTL; `None` means entries never expire.
    pub ttl: Option<TimeSpan>,
}

/// Factory for [`SharedLock`] handles sharing one adapter and namespace.
#[derive(Clone)]
pub struct SharedLockProvider {
    adapter: Arc<dyn SharedLockAdapter>,
    namespace: Namespace,
    default_ttl: Option<TimeSpan>,
    default_blocking: BlockingOptions,
    default_refresh_ttl: TimeSpan,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl SharedLockProvider {
    /// Creates a provider over a direct shared-lock adapter.
    #[must_use]
    pub fn new(adapter: Arc<dyn SharedLockAdapter>, options: SharedLockProviderOptions) -> Self {
        Self {
            adapter,
            namespace: options.namespace,
            default_ttl: options.default_ttl,
            default_blocking: options.default_blocking,
            default_refresh_ttl: options.default_refresh_ttl,
            dispatcher: options.event_dispatcher,
        }
    }

    /// Mints a handle with a generated identity and the provider default
    /// TTL. `limit` bounds the reader side.
    #[must_use]
    pub fn create(&self, key: &str, limit: u32) -> SharedLock {
        self.create_with(
            key,
            limit,
            SharedLockOptions {
                lock_id: None,
                ttl: self.default_ttl,
            },
        )
    }

    /// Mints a handle with explicit settings; see [`SharedLockOptions`].
    #[must_use]
    pub fn create_with(&self, key: &str, limit: u32, options: SharedLockOptions) -> SharedLock {
        SharedLock {
            key: self.namespace.key(key),
            lock_id: options
                .lock_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            limit,
            ttl: options.ttl,
            blocking: self.default_blocking,
            refresh_ttl: self.default_refresh_ttl,
            adapter: Arc::clone(&self.adapter),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }

    /// Re-binds a wire shape to this provider.
    pub fn import(&self, wire: &SharedLockHandleWire) -> Result<SharedLock, WireError> {
        check_version(wire.version)?;
        Ok(self.create_with(
            &wire.key,
            wire.limit,
            SharedLockOptions {
                lock_id: Some(wire.lock_id.clone()),
                ttl: wire.ttl_ms.map(TimeSpan::from_millis),
            },
        ))
    }
}

/// Handle for one key's reader/writer lock.
///
/// The same identity serves as writer owner and reader slot id, so one
/// handle can use either mode (never both at once -- the record enforces
/// disjointness).
pub struct SharedLock {
    key: Key,
    lock_id: String,
    limit: u32,
    ttl: Option<TimeSpan>,
    blocking: BlockingOptions,
    refresh_ttl: TimeSpan,
    adapter: Arc<dyn SharedLockAdapter>,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl std::fmt::Debug for SharedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLock")
            .field("key", &self.key)
            .field("lock_id", &self.lock_id)
            .field("limit", &self.limit)
            .field("ttl", &self.ttl)
            .field("blocking", &self.blocking)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl SharedLock {
    /// The resolved key this handle addresses.
    #[must_use]
    pub fn key(&self) -> &str {
        self.key.resolved()
    }

    /// The identity used for both modes.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// The reader-side capacity this handle requests.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    // --- Writer mode ---

    /// Attempts to take the writer side.
    ///
    /// Fails silently (no state mutation) while any reader slot is
    /// present. Idempotent for this identity, without extending the TTL.
    pub async fn acquire_writer(&self) -> Result<bool, SharedLockError> {
        match self
            .adapter
            .acquire_writer(self.key.namespaced(), &self.lock_id, self.ttl)
            .await
        {
            Ok(true) => {
                debug!(key = %self.key(), owner = %self.lock_id, "shared lock writer acquired");
                self.dispatcher.dispatch(
                    SharedLockEvent::WriterAcquired {
                        key: self.key().to_string(),
                        owner: self.lock_id.clone(),
                        ttl: self.ttl,
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::WriterNotAvailable {
                        key: self.key().to_string(),
                        owner: self.lock_id.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    /// Like [`SharedLock::acquire_writer`] but contention is an error.
    pub async fn acquire_writer_or_fail(&self) -> Result<(), SharedLockError> {
        if self.acquire_writer().await? {
            Ok(())
        } else {
            Err(SharedLockError::WriterNotAvailable {
                key: self.key().to_string(),
                owner: self.lock_id.clone(),
            })
        }
    }

    /// Retries [`SharedLock::acquire_writer`] with the provider's timing.
    pub async fn acquire_writer_blocking(&self) -> Result<bool, SharedLockError> {
        self.acquire_writer_blocking_with(self.blocking).await
    }

    /// Blocking writer acquire with explicit timing.
    pub async fn acquire_writer_blocking_with(
        &self,
        options: BlockingOptions,
    ) -> Result<bool, SharedLockError> {
        let deadline = tokio::time::Instant::now() + options.time.to_duration();
        loop {
            if self.acquire_writer().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(options.interval.to_duration()).await;
        }
    }

    /// Like [`SharedLock::acquire_writer_blocking`] but a timeout is an
    /// error.
    pub async fn acquire_writer_blocking_or_fail(&self) -> Result<(), SharedLockError> {
        if self.acquire_writer_blocking().await? {
            Ok(())
        } else {
            Err(SharedLockError::AcquireTimeout {
                key: self.key().to_string(),
                lock_id: self.lock_id.clone(),
                waited_ms: self.blocking.time.as_millis(),
            })
        }
    }

    /// Releases the writer side if this identity holds it. False (and a
    /// no-op) on a reader-held record.
    pub async fn release_writer(&self) -> Result<bool, SharedLockError> {
        match self
            .adapter
            .release_writer(self.key.namespaced(), &self.lock_id)
            .await
        {
            Ok(true) => {
                debug!(key = %self.key(), owner = %self.lock_id, "shared lock writer released");
                self.dispatcher.dispatch(
                    SharedLockEvent::WriterReleased {
                        key: self.key().to_string(),
                        owner: self.lock_id.clone(),
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::WriterUnownedReleaseTry {
                        key: self.key().to_string(),
                        owner: self.lock_id.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    /// Like [`SharedLock::release_writer`] but a refused release is an
    /// error.
    pub async fn release_writer_or_fail(&self) -> Result<(), SharedLockError> {
        if self.release_writer().await? {
            Ok(())
        } else {
            Err(SharedLockError::UnownedWriterRelease {
                key: self.key().to_string(),
                owner: self.lock_id.clone(),
            })
        }
    }

    /// Extends the writer expiration by the provider default refresh TTL.
    pub async fn refresh_writer(&self) -> Result<bool, SharedLockError> {
        self.refresh_writer_with(self.refresh_ttl).await
    }

    /// Extends the writer expiration by `ttl` from now. Same conditions as
    /// the exclusive lock refresh; false on a reader-held record.
    pub async fn refresh_writer_with(&self, ttl: TimeSpan) -> Result<bool, SharedLockError> {
        match self
            .adapter
            .refresh_writer(self.key.namespaced(), &self.lock_id, ttl)
            .await
        {
            Ok(true) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::WriterRefreshed {
                        key: self.key().to_string(),
                        owner: self.lock_id.clone(),
                        ttl,
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::WriterUnownedRefreshTry {
                        key: self.key().to_string(),
                        owner: self.lock_id.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    /// Like [`SharedLock::refresh_writer`] but a refused refresh is an
    /// error.
    pub async fn refresh_writer_or_fail(&self) -> Result<(), SharedLockError> {
        if self.refresh_writer().await? {
            Ok(())
        } else {
            Err(SharedLockError::UnownedWriterRefresh {
                key: self.key().to_string(),
                owner: self.lock_id.clone(),
            })
        }
    }

    /// Removes the writer regardless of owner. False (and a no-op) when
    /// the record is absent, expired, or reader-held.
    pub async fn force_release_writer(&self) -> Result<bool, SharedLockError> {
        match self.adapter.force_release_writer(self.key.namespaced()).await {
            Ok(has_released) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::WriterForceReleased {
                        key: self.key().to_string(),
                        has_released,
                    }
                    .into(),
                );
                Ok(has_released)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    // --- Reader mode ---

    /// Attempts to take a reader slot.
    ///
    /// Fails silently (no state mutation) while a writer is present.
    /// Idempotent per identity; the recorded limit freezes while any
    /// unexpired slot exists.
    pub async fn acquire_reader(&self) -> Result<bool, SharedLockError> {
        let request = ReaderAcquire {
            key: self.key.namespaced(),
            lock_id: &self.lock_id,
            limit: self.limit,
            ttl: self.ttl,
        };
        match self.adapter.acquire_reader(request).await {
            Ok(true) => {
                debug!(key = %self.key(), lock_id = %self.lock_id, "shared lock reader acquired");
                self.dispatcher.dispatch(
                    SharedLockEvent::ReaderAcquired {
                        key: self.key().to_string(),
                        lock_id: self.lock_id.clone(),
                        ttl: self.ttl,
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::ReaderLimitReached {
                        key: self.key().to_string(),
                        lock_id: self.lock_id.clone(),
                        limit: self.limit,
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    /// Like [`SharedLock::acquire_reader`] but contention is an error.
    pub async fn acquire_reader_or_fail(&self) -> Result<(), SharedLockError> {
        if self.acquire_reader().await? {
            Ok(())
        } else {
            Err(SharedLockError::ReaderLimitReached {
                key: self.key().to_string(),
                lock_id: self.lock_id.clone(),
            })
        }
    }

    /// Retries [`SharedLock::acquire_reader`] with the provider's timing.
    pub async fn acquire_reader_blocking(&self) -> Result<bool, SharedLockError> {
        self.acquire_reader_blocking_with(self.blocking).await
    }

    /// Blocking reader acquire with explicit timing.
    pub async fn acquire_reader_blocking_with(
        &self,
        options: BlockingOptions,
    ) -> Result<bool, SharedLockError> {
        let deadline = tokio::time::Instant::now() + options.time.to_duration();
        loop {
            if self.acquire_reader().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(options.interval.to_duration()).await;
        }
    }

    /// Like [`SharedLock::acquire_reader_blocking`] but a timeout is an
    /// error.
    pub async fn acquire_reader_blocking_or_fail(&self) -> Result<(), SharedLockError> {
        if self.acquire_reader_blocking().await? {
            Ok(())
        } else {
            Err(SharedLockError::AcquireTimeout {
                key: self.key().to_string(),
                lock_id: self.lock_id.clone(),
                waited_ms: self.blocking.time.as_millis(),
            })
        }
    }

    /// Releases this identity's reader slot. False (and a no-op) on a
    /// writer-held record.
    pub async fn release_reader(&self) -> Result<bool, SharedLockError> {
        match self
            .adapter
            .release_reader(self.key.namespaced(), &self.lock_id)
            .await
        {
            Ok(true) => {
                debug!(key = %self.key(), lock_id = %self.lock_id, "shared lock reader released");
                self.dispatcher.dispatch(
                    SharedLockEvent::ReaderReleased {
                        key: self.key().to_string(),
                        lock_id: self.lock_id.clone(),
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::ReaderFailedRelease {
                        key: self.key().to_string(),
                        lock_id: self.lock_id.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    /// Like [`SharedLock::release_reader`] but a refused release is an
    /// error.
    pub async fn release_reader_or_fail(&self) -> Result<(), SharedLockError> {
        if self.release_reader().await? {
            Ok(())
        } else {
            Err(SharedLockError::FailedReaderRelease {
                key: self.key().to_string(),
                lock_id: self.lock_id.clone(),
            })
        }
    }

    /// Extends this reader slot by the provider default refresh TTL.
    pub async fn refresh_reader(&self) -> Result<bool, SharedLockError> {
        self.refresh_reader_with(self.refresh_ttl).await
    }

    /// Extends this reader slot by `ttl` from now; false on a writer-held
    /// record or an unexpireable slot.
    pub async fn refresh_reader_with(&self, ttl: TimeSpan) -> Result<bool, SharedLockError> {
        match self
            .adapter
            .refresh_reader(self.key.namespaced(), &self.lock_id, ttl)
            .await
        {
            Ok(true) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::ReaderRefreshed {
                        key: self.key().to_string(),
                        lock_id: self.lock_id.clone(),
                        ttl,
                    }
                    .into(),
                );
                Ok(true)
            }
            Ok(false) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::ReaderFailedRefresh {
                        key: self.key().to_string(),
                        lock_id: self.lock_id.clone(),
                    }
                    .into(),
                );
                Ok(false)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    /// Like [`SharedLock::refresh_reader`] but a refused refresh is an
    /// error.
    pub async fn refresh_reader_or_fail(&self) -> Result<(), SharedLockError> {
        if self.refresh_reader().await? {
            Ok(())
        } else {
            Err(SharedLockError::FailedReaderRefresh {
                key: self.key().to_string(),
                lock_id: self.lock_id.clone(),
            })
        }
    }

    /// Removes all reader slots. False (and a no-op) when the record is
    /// absent, fully expired, or writer-held.
    pub async fn force_release_all_readers(&self) -> Result<bool, SharedLockError> {
        match self
            .adapter
            .force_release_all_readers(self.key.namespaced())
            .await
        {
            Ok(has_released) => {
                self.dispatcher.dispatch(
                    SharedLockEvent::AllReadersForceReleased {
                        key: self.key().to_string(),
                        has_released,
                    }
                    .into(),
                );
                Ok(has_released)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    // --- Mode-agnostic ---

    /// Wipes whichever mode currently holds the record.
    pub async fn force_release(&self) -> Result<bool, SharedLockError> {
        match self.adapter.force_release(self.key.namespaced()).await {
            Ok(has_released) => {
                if has_released {
                    debug!(key = %self.key(), "shared lock force-released");
                }
                self.dispatcher.dispatch(
                    SharedLockEvent::ForceReleased {
                        key: self.key().to_string(),
                        has_released,
                    }
                    .into(),
                );
                Ok(has_released)
            }
            Err(source) => Err(self.unexpected(source)),
        }
    }

    /// Authoritative snapshot with the disjointness invariant.
    pub async fn get_state(&self) -> Result<SharedLockState, SharedLockError> {
        match self.adapter.get_state(self.key.namespaced()).await {
            Ok(state) => Ok(state),
            Err(source) => Err(self.unexpected(source)),
        }
    }

    /// Acquires the writer side, runs `body`, and always attempts release
    /// afterwards -- also when `body` panics.
    pub async fn run_writer<T, F, Fut>(&self, body: F) -> Result<T, SharedLockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire_writer().await? {
            return Err(SharedLockError::WriterNotAvailable {
                key: self.key().to_string(),
                owner: self.lock_id.clone(),
            });
        }
        let outcome = AssertUnwindSafe(body()).catch_unwind().await;
        let released = self.release_writer().await;
        Self::settle(outcome, released)
    }

    /// Acquires a reader slot, runs `body`, and always attempts release
    /// afterwards -- also when `body` panics.
    pub async fn run_reader<T, F, Fut>(&self, body: F) -> Result<T, SharedLockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire_reader().await? {
            return Err(SharedLockError::ReaderLimitReached {
                key: self.key().to_string(),
                lock_id: self.lock_id.clone(),
            });
        }
        let outcome = AssertUnwindSafe(body()).catch_unwind().await;
        let released = self.release_reader().await;
        Self::settle(outcome, released)
    }

    /// Exports the wire shape of this handle.
    #[must_use]
    pub fn export(&self) -> SharedLockHandleWire {
        SharedLockHandleWire {
            version: WIRE_VERSION,
            key: self.key().to_string(),
            lock_id: self.lock_id.clone(),
            limit: self.limit,
            ttl_ms: self.ttl.map(TimeSpan::as_millis),
        }
    }

    /// Resolves a run-family outcome: panics resume after the release
    /// attempt, release faults surface only on the success path.
    fn settle<T>(
        outcome: Result<T, Box<dyn std::any::Any + Send>>,
        released: Result<bool, SharedLockError>,
    ) -> Result<T, SharedLockError> {
        match outcome {
            Ok(value) => {
                released?;
                Ok(value)
            }
            Err(panic) => {
                if let Err(release_error) = released {
                    warn!(error = %release_error, "release failed while unwinding");
                }
                resume_unwind(panic)
            }
        }
    }

    fn unexpected(&self, source: anyhow::Error) -> SharedLockError {
        warn!(key = %self.key(), lock_id = %self.lock_id, error = %source,
            "shared lock adapter fault");
        self.dispatcher.dispatch(
            SharedLockEvent::UnexpectedError {
                key: self.key().to_string(),
                message: source.to_string(),
            }
            .into(),
        );
        SharedLockError::Unexpected {
            key: self.key().to_string(),
            source,
        }
    }
}
