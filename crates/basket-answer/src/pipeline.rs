//! The query lifecycle.
//!
//! ```text
//! Received -> CacheCheck -> Hit -> Returned
//!                        -> Miss -> Embedding -> Retrieval -> [Fusion] -> ContextBuild
//!                                -> Synthesis -> CacheStore -> Returned
//! any stage -> Failed
//! ```
//!
//! `Failed` produces a degraded answer (confidence 0, no sources, the error
//! as text) instead of an error. Only malformed input is returned as `Err`.

use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use basket_core::config::RagConfig;
use basket_core::error::{Error, Result};
use basket_core::similarity::{validate_basket_id, validate_top_k};
use basket_core::traits::Completer;
use basket_core::types::{Meta, RagAnswer, SearchHit};
use basket_hybrid::HybridRetriever;
use basket_search::{cache_key, QueryCache, SearchOptions, SemanticSearchEngine};

use crate::context::ContextAssembler;
use crate::synth::AnswerSynthesizer;

pub const NO_RELEVANT_DOCUMENTS: &str = "No relevant documents were found to answer this question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Received,
    CacheCheck,
    Embedding,
    Retrieval,
    Fusion,
    ContextBuild,
    Synthesis,
    CacheStore,
    Returned,
    Failed,
}

impl QueryStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::CacheCheck => "cache_check",
            Self::Embedding => "embedding",
            Self::Retrieval => "retrieval",
            Self::Fusion => "fusion",
            Self::ContextBuild => "context_build",
            Self::Synthesis => "synthesis",
            Self::CacheStore => "cache_store",
            Self::Returned => "returned",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Returned | Self::Failed)
    }
}

/// Tracks one query through its stages.
struct Lifecycle {
    key: String,
    stage: QueryStage,
    started: Instant,
}

impl Lifecycle {
    fn new(key: String) -> Self {
        let l = Self { key, stage: QueryStage::Received, started: Instant::now() };
        l.log();
        l
    }

    fn advance(&mut self, next: QueryStage) {
        debug_assert!(!self.stage.is_terminal(), "query already finished");
        self.stage = next;
        self.log();
    }

    fn log(&self) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(key = &self.key[..8], stage = self.stage.as_str(), elapsed_ms, "query stage");
    }
}

enum Retrieval {
    Semantic,
    Hybrid(Arc<HybridRetriever>),
}

impl Retrieval {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Hybrid(_) => "hybrid",
        }
    }
}

pub struct RagPipeline {
    config: Arc<RagConfig>,
    engine: Arc<SemanticSearchEngine>,
    retrieval: Retrieval,
    assembler: ContextAssembler,
    synthesizer: AnswerSynthesizer,
    answers: QueryCache<RagAnswer>,
}

impl RagPipeline {
    pub fn new(config: Arc<RagConfig>, engine: Arc<SemanticSearchEngine>, completer: Arc<dyn Completer>) -> Self {
        Self {
            assembler: ContextAssembler::new(config.max_context_tokens),
            synthesizer: AnswerSynthesizer::new(&config, completer),
            answers: QueryCache::new(config.max_cache_entries, config.cache_ttl()),
            engine,
            retrieval: Retrieval::Semantic,
            config,
        }
    }

    /// Retrieve through `retriever` when `hybrid_search` is enabled.
    pub fn with_hybrid(mut self, retriever: Arc<HybridRetriever>) -> Self {
        if self.config.hybrid_search {
            self.retrieval = Retrieval::Hybrid(retriever);
        } else {
            tracing::info!("hybrid retriever supplied but hybrid_search is off; using semantic search");
        }
        self
    }

    pub fn clear_caches(&self) {
        self.answers.clear();
        self.engine.clear_caches();
    }

    pub fn invalidate_basket(&self, basket_id: &str) {
        self.answers.invalidate_scope(basket_id);
        self.engine.invalidate_basket(basket_id);
    }

    /// Answer with the configured `top_k_documents`.
    pub async fn answer(&self, query: &str, basket_id: Option<&str>) -> Result<RagAnswer> {
        let options = SearchOptions { basket_id: basket_id.map(str::to_string), ..SearchOptions::default() };
        self.answer_with(query, self.config.top_k_documents, &options).await
    }

    pub async fn answer_with(&self, query: &str, top_k: usize, options: &SearchOptions) -> Result<RagAnswer> {
        if query.trim().is_empty() {
            return Err(Error::validation("query must not be empty"));
        }
        validate_top_k(top_k)?;
        if let Some(b) = &options.basket_id {
            validate_basket_id(b)?;
        }

        let style = self.synthesizer.style().as_str();
        let key =
            cache_key(&("answer", query, &options.basket_id, &options.filters, top_k, options.min_similarity, style));
        let mut life = Lifecycle::new(key.clone());
        let mut meta = Meta::new();
        meta.insert("retrieval".into(), json!(self.retrieval.as_str()));
        meta.insert("style".into(), json!(style));

        life.advance(QueryStage::CacheCheck);
        if options.use_cache {
            if let Some(mut cached) = self.answers.get(&key) {
                cached.metadata.insert("cache_hit".into(), json!(true));
                cached.processing_time = life.started.elapsed();
                life.advance(QueryStage::Returned);
                return Ok(cached);
            }
        }
        meta.insert("cache_hit".into(), json!(false));

        let hits = match self.warm_hits(query, top_k, options)? {
            Some(hits) => {
                life.advance(QueryStage::Retrieval);
                hits
            }
            None => {
                life.advance(QueryStage::Embedding);
                let Some(embedding) = self.engine.embed_query(query).await else {
                    meta.insert("failed_stage".into(), json!(QueryStage::Embedding.as_str()));
                    return Ok(self.no_documents(query, meta, &mut life));
                };
                life.advance(QueryStage::Retrieval);
                match self.retrieve(query, &embedding, top_k, options, &mut life, &mut meta).await {
                    Ok(hits) => hits,
                    Err(e) => return Ok(self.failed(query, &e, meta, &mut life)),
                }
            }
        };
        if hits.is_empty() {
            return Ok(self.no_documents(query, meta, &mut life));
        }

        life.advance(QueryStage::ContextBuild);
        let context = self.assembler.assemble(&hits);
        meta.insert("context_tokens".into(), json!(context.tokens));
        meta.insert("context_documents".into(), json!(context.documents));
        meta.insert("context_truncated".into(), json!(context.truncated));

        life.advance(QueryStage::Synthesis);
        let synthesis = match self.synthesizer.synthesize(query, &context, &hits).await {
            Ok(s) => s,
            Err(e) => return Ok(self.failed(query, &e, meta, &mut life)),
        };

        let answer = RagAnswer {
            query: query.to_string(),
            answer: synthesis.answer,
            sources: hits,
            confidence: synthesis.confidence,
            metadata: meta,
            processing_time: life.started.elapsed(),
        };

        if options.use_cache {
            life.advance(QueryStage::CacheStore);
            self.answers.insert(key, answer.clone(), options.basket_id.as_deref());
        }
        life.advance(QueryStage::Returned);
        let elapsed_ms = u64::try_from(answer.processing_time.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(sources = answer.sources.len(), confidence = answer.confidence, elapsed_ms, "answered query");
        Ok(answer)
    }

    /// Semantic hits already in the engine cache. The hybrid vector path
    /// is not cached, so hybrid retrieval always embeds.
    fn warm_hits(&self, query: &str, top_k: usize, options: &SearchOptions) -> Result<Option<Vec<SearchHit>>> {
        match self.retrieval {
            Retrieval::Semantic if options.use_cache => self.engine.cached_hits(query, top_k, options),
            _ => Ok(None),
        }
    }

    async fn retrieve(
        &self,
        query: &str,
        embedding: &[f32],
        top_k: usize,
        options: &SearchOptions,
        life: &mut Lifecycle,
        meta: &mut Meta,
    ) -> Result<Vec<SearchHit>> {
        match &self.retrieval {
            Retrieval::Semantic => self.engine.search_with_embedding(query, embedding, top_k, options).await,
            Retrieval::Hybrid(retriever) => {
                let outcome = retriever.retrieve_with_embedding(query, embedding, top_k, options).await?;
                life.advance(QueryStage::Fusion);
                let degraded: Vec<String> = [("semantic", &outcome.semantic_error), ("vector", &outcome.vector_error)]
                    .into_iter()
                    .filter_map(|(path, e)| e.as_ref().map(|e| format!("{path}: {e}")))
                    .collect();
                if !degraded.is_empty() {
                    meta.insert("degraded_paths".into(), json!(degraded));
                }
                Ok(outcome.hits)
            }
        }
    }

    fn no_documents(&self, query: &str, meta: Meta, life: &mut Lifecycle) -> RagAnswer {
        let answer = degraded(query, NO_RELEVANT_DOCUMENTS.to_string(), meta, life);
        life.advance(QueryStage::Returned);
        answer
    }

    fn failed(&self, query: &str, error: &Error, mut meta: Meta, life: &mut Lifecycle) -> RagAnswer {
        tracing::warn!(stage = life.stage.as_str(), error = %error, "query failed; returning degraded answer");
        meta.insert("failed_stage".into(), json!(life.stage.as_str()));
        meta.insert("error".into(), json!(error.to_string()));
        let answer = degraded(query, format!("Unable to answer this question: {error}"), meta, life);
        life.advance(QueryStage::Failed);
        answer
    }
}

fn degraded(query: &str, text: String, meta: Meta, life: &Lifecycle) -> RagAnswer {
    RagAnswer {
        query: query.to_string(),
        answer: text,
        sources: Vec::new(),
        confidence: 0.0,
        metadata: meta,
        processing_time: life.started.elapsed(),
    }
}
