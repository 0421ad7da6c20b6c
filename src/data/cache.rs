//! In-memory entity caches
//!
//! These caches are volatile and cleared on restart.
//! Uses Moka for high-performance concurrent caching.
//!
//! An entity may be reachable under several keys (id, URI, URL, ...).
//! [`Cacheable::cache_keys`] lists them all, and the `*_entity` methods act
//! on the whole set so that a write never leaves one key pointing at a
//! stale value.
//!
//! Every write path bumps a per-cache generation before touching entries.
//! Readers that fill the cache after a database load go through
//! [`EntityCache::fill_entity`], which refuses to store the loaded value if
//! any write happened since the load started.

use moka::Expiry;
use moka::future::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// An entity that knows every key it is cached under
pub trait Cacheable: Send + Sync + 'static {
    fn cache_keys(&self) -> Vec<String>;
}

struct Slot<V> {
    value: Arc<V>,
    ttl: Duration,
}

impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            ttl: self.ttl,
        }
    }
}

/// Per-entry expiry: each slot carries its own TTL
struct SlotExpiry;

impl<V> Expiry<String, Slot<V>> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, value: &Slot<V>, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Slot<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Size- and time-bounded key → entity map
pub struct EntityCache<V: Cacheable> {
    name: &'static str,
    entries: Cache<String, Slot<V>>,
    default_ttl: Duration,
    generation: AtomicU64,
}

impl<V: Cacheable> EntityCache<V> {
    /// Create a new cache
    ///
    /// # Arguments
    /// * `name` - Label used for metrics and logs
    /// * `max_capacity` - Maximum number of keys held
    /// * `default_ttl` - TTL used by the `*_entity` methods
    pub fn new(name: &'static str, max_capacity: u64, default_ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(SlotExpiry)
            .build();

        Self {
            name,
            entries,
            default_ttl,
            generation: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Write counter; snapshot it before loading a value for [`Self::fill_entity`]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Look up a key; an expired entry is a miss
    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        let result = self.entries.get(key).await.map(|slot| slot.value);

        // Record cache hit/miss
        use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
        if result.is_some() {
            CACHE_HITS_TOTAL.with_label_values(&[self.name]).inc();
        } else {
            CACHE_MISSES_TOTAL.with_label_values(&[self.name]).inc();
        }

        result
    }

    /// Store a value under a single key
    pub async fn put(&self, key: String, value: Arc<V>, ttl: Duration) {
        self.bump();
        self.entries.insert(key, Slot { value, ttl }).await;
        self.record_size();
    }

    pub async fn invalidate(&self, key: &str) {
        self.bump();
        self.entries.invalidate(key).await;
        self.record_size();
    }

    /// Store an entity under every one of its keys
    pub async fn put_entity(&self, value: V) -> Arc<V> {
        self.bump();
        self.insert_entity(value).await
    }

    /// Store an entity read from the database, unless a write landed since
    /// `seen` was taken from [`Self::generation`].
    ///
    /// Returns `None` when the value was discarded. A write racing with the
    /// insert itself causes the just-inserted keys to be dropped again, so the
    /// worst outcome is a miss, never a stale hit.
    pub async fn fill_entity(&self, value: V, seen: u64) -> Option<Arc<V>> {
        if self.generation() != seen {
            return None;
        }

        let keys = value.cache_keys();
        let value = self.insert_entity(value).await;

        if self.generation() != seen {
            for key in &keys {
                self.entries.invalidate(key).await;
            }
            self.record_size();
            tracing::trace!(cache = self.name, "discarded fill raced by a write");
            return None;
        }
        Some(value)
    }

    /// Drop every key of an entity
    pub async fn invalidate_entity(&self, value: &V) {
        self.bump();
        for key in value.cache_keys() {
            self.entries.invalidate(&key).await;
        }
        self.record_size();
    }

    /// Replace a previous version of an entity with its new version.
    ///
    /// Keys the previous version had but the new one lacks are dropped.
    pub async fn replace_entity(&self, previous: Option<&V>, value: V) -> Arc<V> {
        if let Some(previous) = previous {
            self.invalidate_entity(previous).await;
        }
        self.put_entity(value).await
    }

    pub fn clear(&self) {
        self.bump();
        self.entries.invalidate_all();
        tracing::debug!(cache = self.name, "cache cleared");
    }

    async fn insert_entity(&self, value: V) -> Arc<V> {
        let value = Arc::new(value);
        for key in value.cache_keys() {
            self.entries
                .insert(
                    key,
                    Slot {
                        value: Arc::clone(&value),
                        ttl: self.default_ttl,
                    },
                )
                .await;
        }
        self.record_size();
        value
    }

    /// Approximate number of keys held
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    fn record_size(&self) {
        use crate::metrics::CACHE_SIZE;
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(self.entries.entry_count() as i64);
    }
}
