//! Cache primitive: typed key→value map with per-entry TTL and events.
//!
//! [`Cache`] is a typed facade over a [`CacheAdapter`]: values serialize
//! through `serde_json::Value` on the way in and deserialize on the way
//! out. Single-key operations are atomic at the adapter; batch operations
//! compose single-key ops with per-key independence and return aggregate
//! maps. Every operation dispatches its event after the adapter call
//! returns.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::adapter::{CacheAdapter, IncrementOutcome};
use crate::event::{CacheEvent, EventDispatcher, NullEventDispatcher};
use crate::key::Namespace;
use crate::time::TimeSpan;

/// Errors surfaced by the cache primitive.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache key \"{key}\" not found")]
    KeyNotFound { key: String },
    #[error("cache value at \"{key}\" is not numeric")]
    TypeMismatch { key: String },
    #[error("cache value at \"{key}\" failed to (de)serialize")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache adapter fault at \"{key}\"")]
    Adapter {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Configuration for a [`Cache`].
pub struct CacheOptions {
    /// Prefix under which all of this cache's keys are stored; also the
    /// scope of [`Cache::clear`].
    pub namespace: Namespace,
    /// TTL applied by the non-`_with` write operations. `None` means
    /// entries never expire.
    pub default_ttl: Option<TimeSpan>,
    /// Receives every event this cache emits.
    pub event_dispatcher: Arc<dyn EventDispatcher>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            namespace: Namespace::new("holdfast").group("cache"),
            default_ttl: None,
            event_dispatcher: Arc::new(NullEventDispatcher),
        }
    }
}

/// Typed cache over a pluggable adapter.
pub struct Cache<V> {
    adapter: Arc<dyn CacheAdapter>,
    namespace: Namespace,
    default_ttl: Option<TimeSpan>,
    dispatcher: Arc<dyn EventDispatcher>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Cache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a cache over `adapter`.
    #[must_use]
    pub fn new(adapter: Arc<dyn CacheAdapter>, options: CacheOptions) -> Self {
        Self {
            adapter,
            namespace: options.namespace,
            default_ttl: options.default_ttl,
            dispatcher: options.event_dispatcher,
            _value: PhantomData,
        }
    }

    /// Live value for the key, or `None` if absent or expired.
    pub async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        let stored = self
            .adapter
            .get(self.namespace.key(key).namespaced())
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        match stored {
            Some(value) => {
                self.dispatcher
                    .dispatch(CacheEvent::KeyFound { key: key.to_string() }.into());
                self.decode(key, value).map(Some)
            }
            None => {
                self.dispatcher
                    .dispatch(CacheEvent::KeyNotFound { key: key.to_string() }.into());
                Ok(None)
            }
        }
    }

    /// Like [`Cache::get`] but a missing key is an error.
    pub async fn get_or_fail(&self, key: &str) -> Result<V, CacheError> {
        self.get(key).await?.ok_or_else(|| CacheError::KeyNotFound {
            key: key.to_string(),
        })
    }

    /// Whether a live entry exists for the key.
    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let stored = self
            .adapter
            .get(self.namespace.key(key).namespaced())
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        let found = stored.is_some();
        let event = if found {
            CacheEvent::KeyFound { key: key.to_string() }
        } else {
            CacheEvent::KeyNotFound { key: key.to_string() }
        };
        self.dispatcher.dispatch(event.into());
        Ok(found)
    }

    /// Inserts iff the key is absent or expired, with the default TTL.
    pub async fn add(&self, key: &str, value: &V) -> Result<bool, CacheError> {
        self.add_with(key, value, self.default_ttl).await
    }

    /// Inserts iff the key is absent or expired, with an explicit TTL.
    pub async fn add_with(
        &self,
        key: &str,
        value: &V,
        ttl: Option<TimeSpan>,
    ) -> Result<bool, CacheError> {
        let encoded = self.encode(key, value)?;
        let added = self
            .adapter
            .add(self.namespace.key(key).namespaced(), encoded, ttl)
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        if added {
            debug!(key, "cache key added");
            self.dispatcher.dispatch(
                CacheEvent::KeyAdded {
                    key: key.to_string(),
                    ttl,
                }
                .into(),
            );
        }
        Ok(added)
    }

    /// Replaces the value iff a live entry exists; the entry keeps its
    /// expiration.
    pub async fn update(&self, key: &str, value: &V) -> Result<bool, CacheError> {
        let encoded = self.encode(key, value)?;
        let updated = self
            .adapter
            .update(self.namespace.key(key).namespaced(), encoded)
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        if updated {
            self.dispatcher
                .dispatch(CacheEvent::KeyUpdated { key: key.to_string() }.into());
        }
        Ok(updated)
    }

    /// Unconditionally sets value and expiration (default TTL). Returns
    /// whether a live entry was replaced.
    pub async fn put(&self, key: &str, value: &V) -> Result<bool, CacheError> {
        self.put_with(key, value, self.default_ttl).await
    }

    /// Unconditionally sets value and an explicit expiration.
    pub async fn put_with(
        &self,
        key: &str,
        value: &V,
        ttl: Option<TimeSpan>,
    ) -> Result<bool, CacheError> {
        let encoded = self.encode(key, value)?;
        let replaced = self
            .adapter
            .put(self.namespace.key(key).namespaced(), encoded, ttl)
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        if replaced {
            self.dispatcher
                .dispatch(CacheEvent::KeyUpdated { key: key.to_string() }.into());
        } else {
            self.dispatcher.dispatch(
                CacheEvent::KeyAdded {
                    key: key.to_string(),
                    ttl,
                }
                .into(),
            );
        }
        Ok(replaced)
    }

    /// Removes the entry. Returns whether a live entry was removed.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let removed = self
            .adapter
            .remove(self.namespace.key(key).namespaced())
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        if removed {
            self.dispatcher
                .dispatch(CacheEvent::KeyRemoved { key: key.to_string() }.into());
        }
        Ok(removed)
    }

    /// Removes and returns the live value.
    pub async fn get_and_remove(&self, key: &str) -> Result<Option<V>, CacheError> {
        let taken = self
            .adapter
            .get_and_remove(self.namespace.key(key).namespaced())
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        match taken {
            Some(value) => {
                self.dispatcher
                    .dispatch(CacheEvent::KeyRemoved { key: key.to_string() }.into());
                self.decode(key, value).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Adds `delta` to the stored number, preserving the expiration.
    ///
    /// Returns `false` when the key is absent or expired; a live
    /// non-numeric value is [`CacheError::TypeMismatch`].
    pub async fn increment(&self, key: &str, delta: i64) -> Result<bool, CacheError> {
        let outcome = self
            .adapter
            .increment(self.namespace.key(key).namespaced(), delta)
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        match outcome {
            IncrementOutcome::Incremented => {
                self.dispatcher.dispatch(
                    CacheEvent::KeyIncremented {
                        key: key.to_string(),
                        delta,
                    }
                    .into(),
                );
                Ok(true)
            }
            IncrementOutcome::Missing => Ok(false),
            IncrementOutcome::NotNumeric => Err(CacheError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    /// Subtracts `delta` from the stored number, preserving the
    /// expiration. Same outcomes as [`Cache::increment`].
    pub async fn decrement(&self, key: &str, delta: i64) -> Result<bool, CacheError> {
        let negated = delta.checked_neg().unwrap_or(i64::MAX);
        let outcome = self
            .adapter
            .increment(self.namespace.key(key).namespaced(), negated)
            .await
            .map_err(|source| self.adapter_error(key, source))?;
        match outcome {
            IncrementOutcome::Incremented => {
                self.dispatcher.dispatch(
                    CacheEvent::KeyDecremented {
                        key: key.to_string(),
                        delta,
                    }
                    .into(),
                );
                Ok(true)
            }
            IncrementOutcome::Missing => Ok(false),
            IncrementOutcome::NotNumeric => Err(CacheError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    /// Removes every key under this cache's namespace. Returns the number
    /// of removed entries.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        let prefix = self.namespace.prefix();
        let removed = self
            .adapter
            .clear(&prefix)
            .await
            .map_err(|source| self.adapter_error("*", source))?;
        debug!(prefix = %prefix, removed, "cache cleared");
        self.dispatcher
            .dispatch(CacheEvent::KeysCleared { prefix, removed }.into());
        Ok(removed)
    }

    // --- Batch operations ---
    //
    // Single-key ops composed with per-key independence: a contention
    // outcome on one key never affects another. An adapter fault aborts
    // the batch with the typed error.

    /// Fetches several keys; the map holds `None` for missing entries.
    pub async fn get_many(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<V>>, CacheError> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            results.insert((*key).to_string(), self.get(key).await?);
        }
        Ok(results)
    }

    /// [`Cache::add`] for several entries; the map reports each insert.
    pub async fn add_many(
        &self,
        entries: &[(&str, V)],
    ) -> Result<HashMap<String, bool>, CacheError> {
        let mut results = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            results.insert((*key).to_string(), self.add(key, value).await?);
        }
        Ok(results)
    }

    /// [`Cache::update`] for several entries.
    pub async fn update_many(
        &self,
        entries: &[(&str, V)],
    ) -> Result<HashMap<String, bool>, CacheError> {
        let mut results = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            results.insert((*key).to_string(), self.update(key, value).await?);
        }
        Ok(results)
    }

    /// [`Cache::put`] for several entries.
    pub async fn put_many(
        &self,
        entries: &[(&str, V)],
    ) -> Result<HashMap<String, bool>, CacheError> {
        let mut results = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            results.insert((*key).to_string(), self.put(key, value).await?);
        }
        Ok(results)
    }

    /// [`Cache::remove`] for several keys.
    pub async fn remove_many(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, bool>, CacheError> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            results.insert((*key).to_string(), self.remove(key).await?);
        }
        Ok(results)
    }

    fn encode(&self, key: &str, value: &V) -> Result<serde_json::Value, CacheError> {
        serde_json::to_value(value).map_err(|source| CacheError::Codec {
            key: key.to_string(),
            source,
        })
    }

    fn decode(&self, key: &str, value: serde_json::Value) -> Result<V, CacheError> {
        serde_json::from_value(value).map_err(|source| CacheError::Codec {
            key: key.to_string(),
            source,
        })
    }

    fn adapter_error(&self, key: &str, source: anyhow::Error) -> CacheError {
        tracing::warn!(key, error = %source, "cache adapter fault");
        CacheError::Adapter {
            key: key.to_string(),
            source,
        }
    }
}
