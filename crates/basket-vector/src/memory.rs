//! Brute-force in-memory backend.
//!
//! Small sets are scored one document at a time. Above
//! `matrix_threshold` the index keeps a row-major buffer of unit-length
//! embeddings and scores a query as a single matrix-vector product.
//!
//! Delete and update rebuild the whole store from the surviving documents,
//! which is O(n) per call. Rebuilds above `rebuild_warn_threshold` are logged.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use basket_core::config::MemoryConfig;
use basket_core::error::{Error, Result};
use basket_core::filters::{self, Filters};
use basket_core::similarity::{cosine_similarity, dot, l2_normalize, validate_documents};
use basket_core::traits::VectorIndex;
use basket_core::types::{BackendKind, IndexStats, IndexedDocument, Meta, SearchHit};

use crate::{check_query, finish_hits, to_hit};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    docs: Vec<IndexedDocument>,
    positions: HashMap<String, usize>,
    /// `docs.len() * dim` unit-length rows, same order as `docs`.
    matrix: Vec<f32>,
}

impl MemoryState {
    fn build(docs: Vec<IndexedDocument>, dim: usize) -> Self {
        let mut state = Self {
            docs: Vec::with_capacity(docs.len()),
            positions: HashMap::new(),
            matrix: Vec::with_capacity(docs.len() * dim),
        };
        for d in docs {
            state.push(d);
        }
        state
    }

    fn push(&mut self, doc: IndexedDocument) {
        self.matrix.extend(l2_normalize(&doc.embedding));
        self.positions.insert(doc.id.clone(), self.docs.len());
        self.docs.push(doc);
    }
}

pub struct MemoryIndex {
    dim: usize,
    settings: MemoryConfig,
    state: RwLock<Arc<MemoryState>>,
    initialized: AtomicBool,
}

impl MemoryIndex {
    pub fn new(dim: usize, settings: MemoryConfig) -> Self {
        Self {
            dim,
            settings,
            state: RwLock::new(Arc::new(MemoryState::default())),
            initialized: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Result<Arc<MemoryState>> {
        self.state.read().map(|s| Arc::clone(&s)).map_err(|_| Error::unavailable("memory index lock poisoned"))
    }

    fn replace(&self, next: MemoryState) -> Result<()> {
        let mut guard = self.state.write().map_err(|_| Error::unavailable("memory index lock poisoned"))?;
        *guard = Arc::new(next);
        Ok(())
    }

    fn rebuild(&self, survivors: Vec<IndexedDocument>, reason: &str) -> Result<()> {
        if survivors.len() > self.settings.rebuild_warn_threshold {
            tracing::warn!(
                documents = survivors.len(),
                threshold = self.settings.rebuild_warn_threshold,
                reason,
                "memory index rebuild is O(n); consider the local-index backend at this size"
            );
        }
        self.replace(MemoryState::build(survivors, self.dim))
    }

    fn score_all(&self, state: &MemoryState, query: &[f32]) -> Vec<f32> {
        if state.docs.len() > self.settings.matrix_threshold {
            let q = l2_normalize(query);
            state.matrix.chunks_exact(self.dim).map(|row| dot(row, &q).clamp(-1.0, 1.0)).collect()
        } else {
            state.docs.iter().map(|d| cosine_similarity(query, &d.embedding)).collect()
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn initialize(&self) -> Result<()> {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!(dim = self.dim, "memory index ready");
        }
        Ok(())
    }

    async fn add(&self, documents: &[IndexedDocument]) -> Result<()> {
        validate_documents(documents, self.dim)?;
        let current = self.snapshot()?;
        let mut batch_ids = HashSet::new();
        let needs_rebuild =
            documents.iter().any(|d| current.positions.contains_key(&d.id) || !batch_ids.insert(d.id.as_str()));
        if needs_rebuild {
            // re-adding an id replaces it, which needs a rebuild
            let mut merged: HashMap<&str, &IndexedDocument> = HashMap::new();
            let mut order: Vec<&str> = Vec::new();
            for d in current.docs.iter().chain(documents) {
                if merged.insert(d.id.as_str(), d).is_none() {
                    order.push(d.id.as_str());
                }
            }
            let docs = order.into_iter().filter_map(|id| merged.get(id).map(|d| (*d).clone())).collect();
            return self.rebuild(docs, "add");
        }
        let mut guard = self.state.write().map_err(|_| Error::unavailable("memory index lock poisoned"))?;
        let state = Arc::make_mut(&mut *guard);
        for d in documents {
            state.push(d.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filters: Option<&Filters>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        check_query(embedding, self.dim, top_k)?;
        let state = self.snapshot()?;
        if state.docs.is_empty() {
            return Ok(Vec::new());
        }
        let scores = self.score_all(&state, embedding);
        let hits = state
            .docs
            .iter()
            .zip(scores)
            .filter(|(d, s)| {
                min_similarity.map_or(true, |m| *s >= m)
                    && filters.map_or(true, |f| filters::matches(&d.basket_id, &d.metadata, f))
            })
            .map(|(d, s)| to_hit(d, s, BackendKind::Memory))
            .collect();
        Ok(finish_hits(hits, top_k))
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let current = self.snapshot()?;
        let removed = ids.iter().filter(|id| current.positions.contains_key(id.as_str())).count();
        if removed == 0 {
            return Ok(0);
        }
        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let survivors = current.docs.iter().filter(|d| !doomed.contains(d.id.as_str())).cloned().collect();
        self.rebuild(survivors, "delete")?;
        Ok(removed)
    }

    async fn update(&self, document: &IndexedDocument) -> Result<()> {
        validate_documents(std::slice::from_ref(document), self.dim)?;
        let current = self.snapshot()?;
        if !current.positions.contains_key(&document.id) {
            return Err(Error::NotFound(document.id.clone()));
        }
        let docs =
            current.docs.iter().map(|d| if d.id == document.id { document.clone() } else { d.clone() }).collect();
        self.rebuild(docs, "update")
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.snapshot()?.docs.len())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = self.snapshot()?;
        let mut details = Meta::new();
        details.insert("matrix_threshold".into(), json!(self.settings.matrix_threshold));
        details.insert("rebuild_warn_threshold".into(), json!(self.settings.rebuild_warn_threshold));
        let path = if state.docs.len() > self.settings.matrix_threshold { "matrix" } else { "scan" };
        details.insert("search_path".into(), json!(path));
        Ok(IndexStats { backend: BackendKind::Memory, documents: state.docs.len(), dimension: self.dim, details })
    }
}
