use anyhow::Result;
use async_trait::async_trait;
use moka::sync::Cache;
use std::time::Duration;

use basket_core::traits::Embedder;
use basket_core::types::Embedding;

/// Memoises another embedder. Keys are blake3 hashes of the input text;
/// empty results are not cached.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Cache<String, Embedding>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(max_entries).time_to_live(ttl).build();
        Self { inner, cache }
    }

    pub fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    async fn embed(&self, text: &str) -> Result<Option<Embedding>> {
        let key = content_hash(text);
        if let Some(v) = self.cache.get(&key) {
            tracing::trace!("embedding cache hit");
            return Ok(Some(v));
        }
        let out = self.inner.embed(text).await?;
        if let Some(v) = &out {
            self.cache.insert(key, v.clone());
        }
        Ok(out)
    }
}
