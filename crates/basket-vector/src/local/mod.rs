//! Local approximate index with optional on-disk persistence.
//!
//! Vectors live in slot order next to an `AnnStructure` (flat, IVF or
//! graph). The structure proposes candidates, which are then scored exactly
//! under the configured metric. With a directory configured the index is
//! loaded on `initialize` and saved after every mutation.
//!
//! There is no native removal: delete and update rebuild the structure from
//! the surviving documents.

pub mod ann;
mod persist;

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{OnceCell, RwLock};

use basket_core::config::{LocalIndexConfig, Metric};
use basket_core::error::{Error, Result};
use basket_core::filters::{self, Filters};
use basket_core::similarity::{l2_normalize, validate_documents};
use basket_core::traits::VectorIndex;
use basket_core::types::{BackendKind, IndexStats, IndexedDocument, Meta, SearchHit};

use crate::{check_query, finish_hits, to_hit};
use ann::{similarity, AnnStructure};

/// Candidate over-fetch factor when filters or a threshold can discard hits.
const FILTER_WIDEN: usize = 4;
const REBUILD_WARN: usize = 10_000;

#[derive(Debug, Clone)]
pub(crate) struct LocalState {
    /// Stored form of each embedding: unit length under the cosine metric.
    pub(crate) vectors: Vec<Vec<f32>>,
    pub(crate) slot_ids: Vec<String>,
    pub(crate) id_to_slot: HashMap<String, usize>,
    pub(crate) documents: HashMap<String, IndexedDocument>,
    pub(crate) structure: AnnStructure,
}

impl Default for LocalState {
    fn default() -> Self {
        Self {
            vectors: Vec::new(),
            slot_ids: Vec::new(),
            id_to_slot: HashMap::new(),
            documents: HashMap::new(),
            structure: AnnStructure::Flat,
        }
    }
}

pub struct LocalAnnIndex {
    dim: usize,
    settings: LocalIndexConfig,
    dir: Option<PathBuf>,
    state: RwLock<LocalState>,
    ready: OnceCell<()>,
}

impl LocalAnnIndex {
    pub fn new(dim: usize, settings: LocalIndexConfig, dir: Option<PathBuf>) -> Self {
        let state = LocalState { structure: AnnStructure::empty(settings.kind), ..LocalState::default() };
        Self { dim, settings, dir, state: RwLock::new(state), ready: OnceCell::new() }
    }

    fn stored_form(&self, v: &[f32]) -> Vec<f32> {
        match self.settings.metric {
            Metric::Cosine => l2_normalize(v),
            Metric::Euclidean => v.to_vec(),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready.initialized() { Ok(()) } else { Err(Error::unavailable("local index not initialized")) }
    }

    /// Fresh state over `docs`, in the given order.
    fn build_state(&self, docs: Vec<IndexedDocument>) -> LocalState {
        if docs.len() > REBUILD_WARN {
            tracing::warn!(documents = docs.len(), kind = ?self.settings.kind, "rebuilding local index");
        }
        let vectors: Vec<Vec<f32>> = docs.iter().map(|d| self.stored_form(&d.embedding)).collect();
        let structure = AnnStructure::build(&vectors, &self.settings);
        let slot_ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        let id_to_slot = slot_ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let documents = docs.into_iter().map(|d| (d.id.clone(), d)).collect();
        LocalState { vectors, slot_ids, id_to_slot, documents, structure }
    }

    fn ordered_documents(state: &LocalState) -> Vec<IndexedDocument> {
        state.slot_ids.iter().filter_map(|id| state.documents.get(id).cloned()).collect()
    }

    fn restore(&self, decoded: persist::Decoded, side_car: persist::SideCar) -> Result<LocalState> {
        if decoded.dim != self.dim {
            return Err(Error::InvalidConfig(format!(
                "saved local index has dimension {}, configured {}",
                decoded.dim, self.dim
            )));
        }
        let mut slot_ids = vec![String::new(); decoded.vectors.len()];
        for (id, slot) in &side_car.id_to_slot {
            let cell = slot_ids
                .get_mut(*slot)
                .ok_or_else(|| Error::unavailable(format!("slot {slot} out of range in side-car")))?;
            *cell = id.clone();
        }
        let documents: HashMap<String, IndexedDocument> = side_car.documents.into_iter().collect();
        if slot_ids.iter().any(|id| !documents.contains_key(id)) {
            return Err(Error::unavailable("side-car is missing document records"));
        }
        if decoded.kind != self.settings.kind || decoded.metric != self.settings.metric {
            tracing::info!(
                saved = ?decoded.kind,
                configured = ?self.settings.kind,
                "index settings changed; rebuilding from saved documents"
            );
            let docs = slot_ids.iter().filter_map(|id| documents.get(id).cloned()).collect();
            return Ok(self.build_state(docs));
        }
        let id_to_slot = side_car.id_to_slot.into_iter().collect();
        Ok(LocalState { vectors: decoded.vectors, slot_ids, id_to_slot, documents, structure: decoded.structure })
    }

    /// Save `next`, then make it current. A failed save leaves the
    /// previous state in place.
    async fn commit(&self, state: &mut LocalState, next: LocalState) -> Result<()> {
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn persist(&self, state: &LocalState) -> Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let index = persist::encode_index(state, self.settings.metric, self.dim);
        persist::save(dir, index, &persist::side_car(state)).await?;
        tracing::debug!(path = %dir.display(), documents = state.vectors.len(), "local index saved");
        Ok(())
    }

    fn scored_hits(
        &self,
        state: &LocalState,
        slots: impl IntoIterator<Item = usize>,
        query: &[f32],
        filters: Option<&Filters>,
        min_similarity: Option<f32>,
    ) -> Vec<SearchHit> {
        slots
            .into_iter()
            .filter_map(|slot| {
                let doc = state.documents.get(state.slot_ids.get(slot)?)?;
                let score = similarity(self.settings.metric, &state.vectors[slot], query);
                let keep = min_similarity.map_or(true, |m| score >= m)
                    && filters.map_or(true, |f| filters::matches(&doc.basket_id, &doc.metadata, f));
                keep.then(|| to_hit(doc, score, BackendKind::LocalIndex))
            })
            .collect()
    }
}

#[async_trait]
impl VectorIndex for LocalAnnIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalIndex
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn initialize(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                if let Some(dir) = &self.dir {
                    if let Some((decoded, side_car)) = persist::load(dir).await? {
                        let restored = self.restore(decoded, side_car)?;
                        tracing::info!(path = %dir.display(), documents = restored.vectors.len(), "local index loaded");
                        *self.state.write().await = restored;
                    } else {
                        tokio::fs::create_dir_all(dir).await?;
                    }
                }
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    async fn add(&self, documents: &[IndexedDocument]) -> Result<()> {
        validate_documents(documents, self.dim)?;
        self.ensure_ready()?;
        if documents.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let mut seen = std::collections::HashSet::new();
        let replaces = documents.iter().any(|d| state.id_to_slot.contains_key(&d.id) || !seen.insert(d.id.as_str()));
        if replaces {
            let mut docs = Self::ordered_documents(&state);
            for d in documents {
                match docs.iter_mut().find(|x| x.id == d.id) {
                    Some(existing) => *existing = d.clone(),
                    None => docs.push(d.clone()),
                }
            }
            let next = self.build_state(docs);
            return self.commit(&mut state, next).await;
        }
        let mut next = state.clone();
        for d in documents {
            let slot = next.vectors.len();
            next.vectors.push(self.stored_form(&d.embedding));
            next.slot_ids.push(d.id.clone());
            next.id_to_slot.insert(d.id.clone(), slot);
            next.documents.insert(d.id.clone(), d.clone());
            let LocalState { vectors, structure, .. } = &mut next;
            structure.insert(slot, vectors, &self.settings);
        }
        self.commit(&mut state, next).await
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filters: Option<&Filters>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        check_query(embedding, self.dim, top_k)?;
        if let Err(e) = self.ensure_ready() {
            tracing::warn!(error = %e, "local search skipped");
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        if state.vectors.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.stored_form(embedding);
        let narrowing = filters.is_some_and(|f| !f.is_empty()) || min_similarity.is_some();
        let want = if narrowing { top_k.saturating_mul(FILTER_WIDEN) } else { top_k };
        let candidates = state.structure.candidates(&state.vectors, &query, want, &self.settings);
        let considered = candidates.len();
        let mut hits = self.scored_hits(&state, candidates, &query, filters, min_similarity);
        if hits.len() < top_k && considered < state.vectors.len() {
            // the approximate pass came up short; fall back to an exact scan
            hits = self.scored_hits(&state, 0..state.vectors.len(), &query, filters, min_similarity);
        }
        Ok(finish_hits(hits, top_k))
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        self.ensure_ready()?;
        let mut state = self.state.write().await;
        let removed = ids.iter().filter(|id| state.id_to_slot.contains_key(id.as_str())).count();
        if removed == 0 {
            return Ok(0);
        }
        let doomed: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
        let survivors =
            Self::ordered_documents(&state).into_iter().filter(|d| !doomed.contains(d.id.as_str())).collect();
        let next = self.build_state(survivors);
        self.commit(&mut state, next).await?;
        Ok(removed)
    }

    async fn update(&self, document: &IndexedDocument) -> Result<()> {
        validate_documents(std::slice::from_ref(document), self.dim)?;
        self.ensure_ready()?;
        let mut state = self.state.write().await;
        if !state.id_to_slot.contains_key(&document.id) {
            return Err(Error::NotFound(document.id.clone()));
        }
        let docs = Self::ordered_documents(&state)
            .into_iter()
            .map(|d| if d.id == document.id { document.clone() } else { d })
            .collect();
        let next = self.build_state(docs);
        self.commit(&mut state, next).await
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.state.read().await.vectors.len())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = self.state.read().await;
        let mut details = Meta::new();
        details.insert("kind".into(), json!(self.settings.kind));
        details.insert("metric".into(), json!(self.settings.metric));
        match &state.structure {
            AnnStructure::Flat => {}
            AnnStructure::Ivf(ivf) => {
                details.insert("nlist".into(), json!(self.settings.nlist));
                details.insert("nprobe".into(), json!(self.settings.nprobe));
                details.insert("trained".into(), json!(ivf.is_trained()));
            }
            AnnStructure::Graph(_) => {
                details.insert("graph_degree".into(), json!(self.settings.graph_degree));
                details.insert("ef_search".into(), json!(self.settings.ef_search));
            }
        }
        if let Some(dir) = &self.dir {
            details.insert("path".into(), json!(dir.display().to_string()));
        }
        Ok(IndexStats {
            backend: BackendKind::LocalIndex,
            documents: state.vectors.len(),
            dimension: self.dim,
            details,
        })
    }
}
