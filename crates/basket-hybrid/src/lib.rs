//! Hybrid retrieval: the semantic engine and a second vector index queried
//! concurrently, fused by weighted score.
//!
//! Each path's failure is captured on its own and never cancels the other;
//! the result degrades to whichever path succeeded.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use basket_core::config::RagConfig;
use basket_core::error::{Error, Result};
use basket_core::filters;
use basket_core::similarity::{validate_basket_id, validate_top_k, MAX_TOP_K};
use basket_core::traits::VectorIndex;
use basket_core::types::{rank_hits, SearchHit};
use basket_search::{SearchOptions, SemanticSearchEngine};

pub const PATH_KEY: &str = "path";
pub const SEMANTIC_SCORE_KEY: &str = "semantic_score";
pub const VECTOR_SCORE_KEY: &str = "vector_score";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPath {
    Semantic,
    Vector,
}

impl RetrievalPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Vector => "vector",
        }
    }
}

/// Fused hits plus whatever each path reported.
#[derive(Debug)]
pub struct HybridOutcome {
    pub hits: Vec<SearchHit>,
    pub semantic_error: Option<Error>,
    pub vector_error: Option<Error>,
}

impl HybridOutcome {
    pub fn degraded(&self) -> bool {
        self.semantic_error.is_some() || self.vector_error.is_some()
    }
}

pub struct HybridRetriever {
    semantic: Arc<SemanticSearchEngine>,
    vector: Arc<dyn VectorIndex>,
    semantic_weight: f32,
    vector_weight: f32,
    min_similarity: f32,
}

impl HybridRetriever {
    pub fn new(config: &RagConfig, semantic: Arc<SemanticSearchEngine>, vector: Arc<dyn VectorIndex>) -> Self {
        Self {
            semantic,
            vector,
            semantic_weight: config.semantic_weight,
            vector_weight: config.vector_weight,
            min_similarity: config.min_similarity,
        }
    }

    pub async fn retrieve(&self, query: &str, top_k: usize, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        Ok(self.retrieve_detailed(query, top_k, options).await?.hits)
    }

    /// Only malformed input is an `Err`; path failures land in the outcome.
    pub async fn retrieve_detailed(&self, query: &str, top_k: usize, options: &SearchOptions) -> Result<HybridOutcome> {
        validate(query, top_k, options)?;
        match self.semantic.embed_query(query).await {
            Some(embedding) => self.retrieve_with_embedding(query, &embedding, top_k, options).await,
            None => Ok(HybridOutcome {
                hits: Vec::new(),
                semantic_error: Some(Error::unavailable("query embedding unavailable")),
                vector_error: Some(Error::unavailable("query embedding unavailable")),
            }),
        }
    }

    /// Both paths share one query embedding.
    pub async fn retrieve_with_embedding(
        &self,
        query: &str,
        embedding: &[f32],
        top_k: usize,
        options: &SearchOptions,
    ) -> Result<HybridOutcome> {
        validate(query, top_k, options)?;
        let (semantic, vector) = tokio::join!(
            self.semantic.search_with_embedding(query, embedding, top_k, options),
            self.vector_path(embedding, top_k, options)
        );

        let (semantic_hits, semantic_error) = split(RetrievalPath::Semantic, semantic);
        let (vector_hits, vector_error) = split(RetrievalPath::Vector, vector);
        let hits = fuse(semantic_hits, vector_hits, self.semantic_weight, self.vector_weight, top_k);
        Ok(HybridOutcome { hits, semantic_error, vector_error })
    }

    async fn vector_path(&self, embedding: &[f32], top_k: usize, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        let scoped = filters::with_basket(options.filters.as_ref(), options.basket_id.as_deref());
        let min_similarity = options.min_similarity.unwrap_or(self.min_similarity);
        let fetch = top_k.saturating_mul(2).min(MAX_TOP_K);
        self.vector.search(embedding, fetch, scoped.as_ref(), Some(min_similarity)).await
    }
}

fn validate(query: &str, top_k: usize, options: &SearchOptions) -> Result<()> {
    if query.trim().is_empty() {
        return Err(Error::validation("query must not be empty"));
    }
    validate_top_k(top_k)?;
    match &options.basket_id {
        Some(b) => validate_basket_id(b),
        None => Ok(()),
    }
}

fn split(path: RetrievalPath, outcome: Result<Vec<SearchHit>>) -> (Vec<SearchHit>, Option<Error>) {
    match outcome {
        Ok(hits) => (hits, None),
        Err(e) => {
            tracing::warn!(path = path.as_str(), error = %e, "retrieval path failed; continuing with the other");
            (Vec::new(), Some(e))
        }
    }
}

/// `combined = semantic * semantic_weight` or `vector * vector_weight`,
/// one entry per document id (the higher combined score wins), ranked and
/// truncated to `top_k`.
pub fn fuse(
    semantic: Vec<SearchHit>,
    vector: Vec<SearchHit>,
    semantic_weight: f32,
    vector_weight: f32,
    top_k: usize,
) -> Vec<SearchHit> {
    let weighted = |path: RetrievalPath, weight: f32| {
        move |mut hit: SearchHit| {
            let key = match path {
                RetrievalPath::Semantic => SEMANTIC_SCORE_KEY,
                RetrievalPath::Vector => VECTOR_SCORE_KEY,
            };
            hit.provenance.insert(key.into(), json!(hit.score));
            hit.provenance.insert(PATH_KEY.into(), json!(path.as_str()));
            hit.score *= weight;
            hit
        }
    };
    let semantic = semantic.into_iter().map(weighted(RetrievalPath::Semantic, semantic_weight));
    let vector = vector.into_iter().map(weighted(RetrievalPath::Vector, vector_weight));

    let mut by_id: HashMap<String, SearchHit> = HashMap::new();
    for h in semantic.chain(vector) {
        by_id
            .entry(h.document.id.clone())
            .and_modify(|old| {
                let (mut winner, loser) =
                    if h.score > old.score { (h.clone(), old.clone()) } else { (old.clone(), h.clone()) };
                // keep the raw score the losing path saw
                for key in [SEMANTIC_SCORE_KEY, VECTOR_SCORE_KEY] {
                    if let Some(v) = loser.provenance.get(key) {
                        winner.provenance.entry(key.into()).or_insert_with(|| v.clone());
                    }
                }
                *old = winner;
            })
            .or_insert(h);
    }
    let mut merged: Vec<SearchHit> = by_id.into_values().collect();
    rank_hits(&mut merged, top_k);
    merged
}
