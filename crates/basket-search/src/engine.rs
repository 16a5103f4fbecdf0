//! Query text -> ranked hits through one `VectorIndex`.
//!
//! Flow on a cache miss: embed the query, over-fetch `2 * top_k` from the
//! index, drop hits under the threshold, resolve owning documents one basket
//! at a time, re-apply metadata filters, rank, truncate, cache. Empty results
//! are not cached: backends report outages as "no hits".
//!
//! The basket listing and document -> basket maps grow for the life of the
//! engine; `invalidate_basket` and `clear_caches` are the only eviction.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use basket_core::config::RagConfig;
use basket_core::error::{Error, Result};
use basket_core::filters::{self, Filters};
use basket_core::similarity::{validate_basket_id, validate_top_k, MAX_TOP_K};
use basket_core::traits::{DocumentStore, Embedder, VectorIndex};
use basket_core::types::{rank_hits, Document, DocumentRef, Embedding, SearchHit};

use crate::cache::{cache_key, QueryCache};

/// Per-call knobs. `min_similarity: None` uses the configured default.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub basket_id: Option<String>,
    pub filters: Option<Filters>,
    pub min_similarity: Option<f32>,
    pub use_cache: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { basket_id: None, filters: None, min_similarity: None, use_cache: true }
    }
}

impl SearchOptions {
    pub fn in_basket(basket_id: impl Into<String>) -> Self {
        Self { basket_id: Some(basket_id.into()), ..Self::default() }
    }
}

type Listing = Arc<HashMap<String, Document>>;

pub struct SemanticSearchEngine {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    documents: Arc<dyn DocumentStore>,
    default_min_similarity: f32,
    cache: QueryCache<Vec<SearchHit>>,
    /// document id -> basket id
    doc_baskets: DashMap<String, String>,
    /// basket id -> its documents, keyed by id
    listings: DashMap<String, Listing>,
}

impl SemanticSearchEngine {
    pub fn new(
        config: &RagConfig,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            index,
            embedder,
            documents,
            default_min_similarity: config.min_similarity,
            cache: QueryCache::new(config.max_cache_entries, config.cache_ttl()),
            doc_baskets: DashMap::new(),
            listings: DashMap::new(),
        }
    }

    pub fn cached_queries(&self) -> u64 {
        self.cache.len()
    }

    /// Drop cached results and the listing for `basket_id`, e.g. after ingestion.
    pub fn invalidate_basket(&self, basket_id: &str) {
        self.cache.invalidate_scope(basket_id);
        self.listings.remove(basket_id);
        self.doc_baskets.retain(|_, b| b.as_str() != basket_id);
        tracing::debug!(basket_id, "basket caches invalidated");
    }

    pub fn clear_caches(&self) {
        self.cache.clear();
        self.listings.clear();
        self.doc_baskets.clear();
    }

    /// Embed `query`. `None` (logged) when the embedder fails or returns nothing.
    pub async fn embed_query(&self, query: &str) -> Option<Embedding> {
        match self.embedder.embed(query).await {
            Ok(Some(v)) if !v.is_empty() => Some(v),
            Ok(_) => {
                tracing::warn!("embedder returned no vector for query");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed");
                None
            }
        }
    }

    pub async fn search(&self, query: &str, top_k: usize, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        let (key, min_similarity) = self.prepare(query, top_k, options)?;
        if let Some(hits) = self.cached(&key, options) {
            return Ok(hits);
        }
        let Some(embedding) = self.embed_query(query).await else { return Ok(Vec::new()) };
        self.retrieve(key, &embedding, top_k, min_similarity, options).await
    }

    /// Same as `search` for callers that already embedded the query.
    pub async fn search_with_embedding(
        &self,
        query: &str,
        embedding: &[f32],
        top_k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let (key, min_similarity) = self.prepare(query, top_k, options)?;
        if let Some(hits) = self.cached(&key, options) {
            return Ok(hits);
        }
        self.retrieve(key, embedding, top_k, min_similarity, options).await
    }

    /// Hits already cached for this request. Never embeds or searches.
    pub fn cached_hits(&self, query: &str, top_k: usize, options: &SearchOptions) -> Result<Option<Vec<SearchHit>>> {
        let (key, _) = self.prepare(query, top_k, options)?;
        Ok(self.cached(&key, options))
    }

    fn prepare(&self, query: &str, top_k: usize, options: &SearchOptions) -> Result<(String, f32)> {
        if query.trim().is_empty() {
            return Err(Error::validation("query must not be empty"));
        }
        validate_top_k(top_k)?;
        if let Some(b) = &options.basket_id {
            validate_basket_id(b)?;
        }
        let min_similarity = options.min_similarity.unwrap_or(self.default_min_similarity);
        let key = cache_key(&(query, &options.basket_id, &options.filters, top_k, min_similarity));
        Ok((key, min_similarity))
    }

    fn cached(&self, key: &str, options: &SearchOptions) -> Option<Vec<SearchHit>> {
        if !options.use_cache {
            return None;
        }
        let hits = self.cache.get(key)?;
        tracing::debug!(key = &key[..8], hits = hits.len(), "query cache hit");
        Some(hits)
    }

    async fn retrieve(
        &self,
        key: String,
        embedding: &[f32],
        top_k: usize,
        min_similarity: f32,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let short = &key[..8];
        let scoped = filters::with_basket(options.filters.as_ref(), options.basket_id.as_deref());
        let fetch = top_k.saturating_mul(2).min(MAX_TOP_K);
        let raw = match self.index.search(embedding, fetch, scoped.as_ref(), Some(min_similarity)).await {
            Ok(hits) => hits,
            Err(e) if e.is_validation() => return Err(e),
            Err(e) => {
                tracing::warn!(key = short, error = %e, "index search failed; returning no hits");
                return Ok(Vec::new());
            }
        };
        let fetched = raw.len();
        let above: Vec<SearchHit> = raw.into_iter().filter(|h| h.score >= min_similarity).collect();

        let mut hits = self.resolve(above).await;
        if let Some(f) = &scoped {
            hits.retain(|h| filters::matches(&h.document.basket_id, &h.provenance, f));
        }
        rank_hits(&mut hits, top_k);
        tracing::debug!(key = short, fetched, returned = hits.len(), "semantic search");

        // empty can be an outage the backend swallowed
        if options.use_cache && !hits.is_empty() {
            self.cache.insert(key, hits.clone(), options.basket_id.as_deref());
        }
        Ok(hits)
    }

    /// Replace each hit's document with the store's record, one listing per
    /// basket. Ids the store no longer knows are dropped.
    async fn resolve(&self, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let mut by_basket: BTreeMap<String, Vec<SearchHit>> = BTreeMap::new();
        for hit in hits {
            let basket = match self.basket_for(&hit).await {
                Some(b) => b,
                None => continue,
            };
            by_basket.entry(basket).or_default().push(hit);
        }

        let mut out = Vec::new();
        for (basket, group) in by_basket {
            let Some(mut listing) = self.listing(&basket, false).await else {
                // store unavailable: keep what the index returned
                out.extend(group);
                continue;
            };
            if group.iter().any(|h| !listing.contains_key(&h.document.id)) {
                if let Some(fresh) = self.listing(&basket, true).await {
                    listing = fresh;
                }
            }
            for mut hit in group {
                match listing.get(&hit.document.id) {
                    Some(doc) => {
                        hit.document = DocumentRef::new(
                            doc.id.clone(),
                            doc.name.clone(),
                            doc.basket_id.clone(),
                            doc.content.clone(),
                        );
                        for (k, v) in &doc.metadata {
                            hit.provenance.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                        out.push(hit);
                    }
                    None => tracing::debug!(id = %hit.document.id, basket = %basket, "skipping unresolvable document"),
                }
            }
        }
        out
    }

    async fn basket_for(&self, hit: &SearchHit) -> Option<String> {
        if !hit.document.basket_id.is_empty() {
            return Some(hit.document.basket_id.clone());
        }
        if let Some(b) = self.doc_baskets.get(&hit.document.id) {
            return Some(b.clone());
        }
        match self.documents.get_document(&hit.document.id).await {
            Ok(Some(doc)) => {
                self.doc_baskets.insert(doc.id.clone(), doc.basket_id.clone());
                Some(doc.basket_id)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(id = %hit.document.id, error = %e, "document lookup failed");
                None
            }
        }
    }

    async fn listing(&self, basket: &str, refresh: bool) -> Option<Listing> {
        if !refresh {
            if let Some(l) = self.listings.get(basket) {
                return Some(Arc::clone(&l));
            }
        }
        match self.documents.list_by_basket(basket).await {
            Ok(docs) => {
                for d in &docs {
                    self.doc_baskets.insert(d.id.clone(), d.basket_id.clone());
                }
                let listing: Listing = Arc::new(docs.into_iter().map(|d| (d.id.clone(), d)).collect());
                self.listings.insert(basket.to_string(), Arc::clone(&listing));
                Some(listing)
            }
            Err(e) => {
                tracing::warn!(basket, error = %e, "listing documents failed");
                None
            }
        }
    }
}
