//! Domain types shared by the index backends, the search engines and the
//! answer pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub type DocId = String;
pub type Embedding = Vec<f32>;
/// Free-form metadata attached to documents, hits and answers.
pub type Meta = HashMap<String, serde_json::Value>;

/// Characters of content carried in `DocumentRef::preview`.
pub const PREVIEW_CHARS: usize = 200;

/// A document as stored by a `VectorIndex`.
///
/// - `id`: unique within the index
/// - `content`: the text that was embedded
/// - `embedding`: fixed dimension per index, finite values only
/// - `basket_id`: owning scope
/// - `metadata`: free-form, used by metadata filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: DocId,
    pub content: String,
    pub embedding: Embedding,
    pub basket_id: String,
    #[serde(default)]
    pub metadata: Meta,
}

/// A document as returned by the document collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub name: String,
    pub content: String,
    pub basket_id: String,
    #[serde(default)]
    pub metadata: Meta,
}

/// Which backend (or retrieval path) produced a hit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Memory,
    Relational,
    LocalIndex,
    ManagedCloud,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Relational => "relational",
            Self::LocalIndex => "local-index",
            Self::ManagedCloud => "managed-cloud",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lightweight document reference a hit carries: enough for context
/// assembly and citations, nothing more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: DocId,
    pub name: String,
    pub basket_id: String,
    pub content: String,
    pub preview: String,
}

impl DocumentRef {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        basket_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let preview = preview_of(&content);
        Self { id: id.into(), name: name.into(), basket_id: basket_id.into(), content, preview }
    }
}

/// One ranked search result.
///
/// `score` is cosine similarity in [-1, 1] for the memory, local (cosine)
/// and managed backends, `1 - cosine distance` for the relational backend,
/// `1 / (1 + d)` in (0, 1] for the local index with the Euclidean metric, and
/// the weighted fused score for hybrid results. Higher is always better.
/// `rank` is 1-based within the list it was returned in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document: DocumentRef,
    pub score: f32,
    pub rank: usize,
    pub source: BackendKind,
    #[serde(default)]
    pub provenance: Meta,
}

impl SearchHit {
    pub fn id(&self) -> &str {
        &self.document.id
    }
}

/// Sort descending by score, truncate to `top_k`, and renumber ranks.
pub fn rank_hits(hits: &mut Vec<SearchHit>, top_k: usize) {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);
    for (i, h) in hits.iter_mut().enumerate() {
        h.rank = i + 1;
    }
}

pub fn preview_of(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() { format!("{head}...") } else { head }
}

/// Answer-style instruction given to the completion collaborator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStyle {
    #[default]
    Concise,
    Detailed,
    BulletPoints,
}

impl AnswerStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Concise => "concise",
            Self::Detailed => "detailed",
            Self::BulletPoints => "bullet_points",
        }
    }
}

/// The final product of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagAnswer {
    pub query: String,
    pub answer: String,
    pub sources: Vec<SearchHit>,
    pub confidence: f32,
    #[serde(default)]
    pub metadata: Meta,
    pub processing_time: Duration,
}

/// Summary reported by `VectorIndex::stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub backend: BackendKind,
    pub documents: usize,
    pub dimension: usize,
    #[serde(default)]
    pub details: Meta,
}

/// Parameters for the completion collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}
