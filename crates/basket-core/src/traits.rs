use async_trait::async_trait;

use crate::error::Result;
use crate::filters::Filters;
use crate::types::{BackendKind, CompletionRequest, Document, Embedding, IndexStats, IndexedDocument, SearchHit};

/// Embedding collaborator. `Ok(None)` means the provider produced nothing
/// for this text; callers treat it like a failure.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    async fn embed(&self, text: &str) -> anyhow::Result<Option<Embedding>>;
}

/// Completion collaborator.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String>;
}

/// Document collaborator. `Ok(None)` is "not found".
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>>;
    async fn list_by_basket(&self, basket_id: &str) -> anyhow::Result<Vec<Document>>;
}

/// Storage and similarity search over embeddings.
///
/// Every backend validates input synchronously (`Error::Validation`) and
/// returns at most `top_k` hits sorted by descending score, with
/// `min_similarity` and `filters` applied before truncation. Read paths that
/// hit an unreachable backend log the failure and return an empty list.
/// Mutations are expected to be serialized by the caller.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn dimension(&self) -> usize;
    /// Connect or allocate. Safe to call more than once.
    async fn initialize(&self) -> Result<()>;
    async fn add(&self, documents: &[IndexedDocument]) -> Result<()>;
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filters: Option<&Filters>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>>;
    /// Returns how many of `ids` were present.
    async fn delete(&self, ids: &[String]) -> Result<usize>;
    async fn update(&self, document: &IndexedDocument) -> Result<()>;
    async fn count(&self) -> Result<usize>;
    async fn stats(&self) -> Result<IndexStats>;
}
