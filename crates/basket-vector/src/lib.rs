//! `VectorIndex` backends.
//!
//! - `memory`: brute-force cosine over an in-process store
//! - `relational`: Postgres with a pgvector column, parameterized SQL
//! - `local`: approximate index (flat / IVF / graph) persisted to disk
//! - `managed`: REST vector service with batching and retry
//!
//! `open_index` picks one backend from configuration; callers only ever see
//! `Arc<dyn VectorIndex>`.

pub mod local;
pub mod managed;
pub mod memory;
pub mod relational;
pub mod retry;

pub use local::LocalAnnIndex;
pub use managed::ManagedIndex;
pub use memory::MemoryIndex;
pub use relational::PgVectorIndex;

use std::path::Path;
use std::sync::Arc;

use basket_core::config::RagConfig;
use basket_core::error::{Error, Result};
use basket_core::similarity::{validate_embedding, validate_top_k};
use basket_core::traits::VectorIndex;
use basket_core::types::{rank_hits, BackendKind, DocumentRef, IndexedDocument, Meta, SearchHit};

/// Metadata key holding a human-readable document name.
pub const NAME_KEY: &str = "name";

/// Build the configured backend. Relative local-index paths resolve against `base_dir`.
pub fn open_index(config: &RagConfig, base_dir: &Path) -> Result<Arc<dyn VectorIndex>> {
    let dim = config.embedding_dimension;
    let index: Arc<dyn VectorIndex> = match config.vector_backend_type {
        BackendKind::Memory => Arc::new(MemoryIndex::new(dim, config.memory.clone())),
        BackendKind::Relational => {
            let rel =
                config.relational.clone().ok_or_else(|| Error::InvalidConfig("missing [relational] section".into()))?;
            Arc::new(PgVectorIndex::new(dim, rel)?)
        }
        BackendKind::LocalIndex => {
            let local = config.local_index.clone().unwrap_or_default();
            let dir = local.resolved_path(base_dir);
            Arc::new(LocalAnnIndex::new(dim, local, dir))
        }
        BackendKind::ManagedCloud => {
            let managed =
                config.managed.clone().ok_or_else(|| Error::InvalidConfig("missing [managed] section".into()))?;
            Arc::new(ManagedIndex::new(dim, managed)?)
        }
    };
    tracing::info!(backend = %index.kind(), dim, "vector index selected");
    Ok(index)
}

pub(crate) fn check_query(embedding: &[f32], dim: usize, top_k: usize) -> Result<()> {
    validate_top_k(top_k)?;
    validate_embedding(embedding, dim)
}

pub(crate) fn display_name(id: &str, metadata: &Meta) -> String {
    metadata.get(NAME_KEY).and_then(|v| v.as_str()).map_or_else(|| id.to_string(), str::to_string)
}

pub(crate) fn to_hit(doc: &IndexedDocument, score: f32, source: BackendKind) -> SearchHit {
    SearchHit {
        document: DocumentRef::new(
            doc.id.clone(),
            display_name(&doc.id, &doc.metadata),
            doc.basket_id.clone(),
            doc.content.clone(),
        ),
        score,
        rank: 0,
        source,
        provenance: doc.metadata.clone(),
    }
}

pub(crate) fn finish_hits(mut hits: Vec<SearchHit>, top_k: usize) -> Vec<SearchHit> {
    rank_hits(&mut hits, top_k);
    hits
}
