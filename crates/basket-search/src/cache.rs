use moka::sync::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cached value with its insertion time and TTL. `scope` records the
/// basket the value was computed for, if any, so a basket can be
/// invalidated without clearing everything.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub scope: Option<String>,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

/// Deterministic key for any serializable tuple of query parameters.
///
/// Filters are `BTreeMap`s, so equal inputs always serialize identically.
pub fn cache_key<T: Serialize + ?Sized>(parts: &T) -> String {
    let bytes = serde_json::to_vec(parts).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Bounded TTL cache shared across concurrent queries.
///
/// Eviction is moka's (size-bounded, TTL on write); freshness is also
/// checked against the entry's own timestamp on every read.
pub struct QueryCache<V: Clone + Send + Sync + 'static> {
    inner: Cache<String, Arc<CacheEntry<V>>>,
    ttl: Duration,
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let inner =
            Cache::builder().max_capacity(max_entries).time_to_live(ttl).support_invalidation_closures().build();
        Self { inner, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.inner.get(key)?;
        if entry.is_fresh(Instant::now()) {
            Some(entry.value.clone())
        } else {
            self.inner.invalidate(key);
            None
        }
    }

    pub fn insert(&self, key: String, value: V, scope: Option<&str>) {
        let entry = CacheEntry { value, scope: scope.map(str::to_string), inserted_at: Instant::now(), ttl: self.ttl };
        self.inner.insert(key, Arc::new(entry));
    }

    /// Drop entries computed for `basket` and every unscoped entry.
    pub fn invalidate_scope(&self, basket: &str) {
        let basket = basket.to_string();
        let predicate = move |_: &String, e: &Arc<CacheEntry<V>>| e.scope.as_deref().map_or(true, |s| s == basket);
        if let Err(e) = self.inner.invalidate_entries_if(predicate) {
            tracing::warn!(error = %e, "scoped invalidation unavailable; clearing query cache");
            self.inner.invalidate_all();
        }
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
