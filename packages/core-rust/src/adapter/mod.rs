//! Storage adapter layer: record shapes, contracts, and reference backends.
//!
//! The adapter layer exists in two flavors per primitive. The *direct*
//! contracts ([`LockAdapter`], [`SemaphoreAdapter`], [`SharedLockAdapter`],
//! [`CacheAdapter`]) expose one atomic call per operation; the *database*
//! contracts ([`DatabaseLockAdapter`], [`DatabaseSemaphoreAdapter`])
//! decompose into conditional CRUD rows and are normalized to the direct
//! form by a bridge at provider-mint time. The in-memory adapters in
//! [`memory`] are the reference implementation of the direct semantics.

pub mod contracts;
pub mod database;
pub mod memory;
pub mod record;

pub use contracts::{
    CacheAdapter, IncrementOutcome, LockAdapter, ReaderAcquire, SemaphoreAcquire,
    SemaphoreAdapter, SharedLockAdapter,
};
pub use database::{
    DatabaseLockAdapter, DatabaseSemaphoreAdapter, LockAdapterBridge, LockBackend,
    SemaphoreAdapterBridge, SemaphoreBackend, SlotInsert,
};
pub use memory::{
    MemoryCacheAdapter, MemoryLockAdapter, MemorySemaphoreAdapter, MemorySharedLockAdapter,
};
pub use record::{CacheEntry, LockRecord, SemaphoreRecord, SharedLockState};
