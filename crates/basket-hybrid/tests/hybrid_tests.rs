use async_trait::async_trait;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use basket_core::config::{MemoryConfig, RagConfig};
use basket_core::store::MemoryDocumentStore;
use basket_core::traits::{Embedder, VectorIndex};
use basket_core::types::{BackendKind, DocumentRef, Embedding, IndexStats, IndexedDocument, Meta, SearchHit};
use basket_core::{Document, Error, Filters, Result};
use basket_hybrid::{fuse, HybridRetriever, PATH_KEY};
use basket_search::{SearchOptions, SemanticSearchEngine};
use basket_vector::MemoryIndex;

struct FixedEmbedder(Option<Embedding>);

#[async_trait]
impl Embedder for FixedEmbedder {
    fn dim(&self) -> usize {
        3
    }
    async fn embed(&self, _text: &str) -> anyhow::Result<Option<Embedding>> {
        Ok(self.0.clone())
    }
}

/// Sleeps before answering, or fails outright.
struct SlowIndex {
    inner: MemoryIndex,
    delay: Duration,
    fail: bool,
}

#[async_trait]
impl VectorIndex for SlowIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }
    fn dimension(&self) -> usize {
        3
    }
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }
    async fn add(&self, documents: &[IndexedDocument]) -> Result<()> {
        self.inner.add(documents).await
    }
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filters: Option<&Filters>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::unavailable("connection refused"));
        }
        self.inner.search(embedding, top_k, filters, min_similarity).await
    }
    async fn delete(&self, ids: &[String]) -> Result<usize> {
        self.inner.delete(ids).await
    }
    async fn update(&self, document: &IndexedDocument) -> Result<()> {
        self.inner.update(document).await
    }
    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
    async fn stats(&self) -> Result<IndexStats> {
        self.inner.stats().await
    }
}

fn indexed(id: &str, embedding: [f32; 3]) -> IndexedDocument {
    IndexedDocument {
        id: id.into(),
        content: format!("text {id}"),
        embedding: embedding.to_vec(),
        basket_id: "b".into(),
        metadata: Meta::new(),
    }
}

async fn retriever(primary: SlowIndex, secondary: SlowIndex, embedding: Option<Embedding>) -> HybridRetriever {
    let config = RagConfig { min_similarity: 0.0, embedding_dimension: 3, ..RagConfig::default() };
    let store = Arc::new(MemoryDocumentStore::new());
    for id in ["A", "B", "C", "D"] {
        store.insert(Document {
            id: id.into(),
            name: id.into(),
            content: format!("text {id}"),
            basket_id: "b".into(),
            metadata: Meta::new(),
        });
    }
    primary.add(&[indexed("A", [1.0, 0.0, 0.0]), indexed("B", [0.0, 1.0, 0.0])]).await.unwrap();
    secondary.add(&[indexed("A", [0.8, 0.6, 0.0]), indexed("C", [0.9, 0.1, 0.0])]).await.unwrap();
    let embedder = Arc::new(FixedEmbedder(embedding));
    let engine = Arc::new(SemanticSearchEngine::new(&config, Arc::new(primary), embedder, store));
    HybridRetriever::new(&config, engine, Arc::new(secondary))
}

fn slow(delay_ms: u64, fail: bool) -> SlowIndex {
    SlowIndex { inner: MemoryIndex::new(3, MemoryConfig::default()), delay: Duration::from_millis(delay_ms), fail }
}

fn ids(hits: &[SearchHit]) -> Vec<&str> {
    hits.iter().map(|h| h.document.id.as_str()).collect()
}

#[tokio::test]
async fn fuses_both_paths_without_duplicates() {
    let r = retriever(slow(0, false), slow(0, false), Some(vec![1.0, 0.0, 0.0])).await;
    let outcome = r.retrieve_detailed("q", 3, &SearchOptions::default()).await.unwrap();
    assert!(!outcome.degraded());
    // A: semantic 1.0*0.7 beats vector 0.8*0.3; C: 0.994*0.3; B: 0
    assert_eq!(ids(&outcome.hits), ["A", "C", "B"]);
    assert_eq!(outcome.hits[0].provenance.get(PATH_KEY), Some(&serde_json::json!("semantic")));
    assert_eq!(outcome.hits[1].provenance.get(PATH_KEY), Some(&serde_json::json!("vector")));
}

#[tokio::test]
async fn paths_run_concurrently() {
    let r = retriever(slow(300, false), slow(300, false), Some(vec![1.0, 0.0, 0.0])).await;
    let started = Instant::now();
    let hits = r.retrieve("q", 3, &SearchOptions::default()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(550), "paths ran one after the other");
    assert_eq!(hits.len(), 3);
}

#[tokio::test]
async fn a_failing_path_degrades_to_the_other() {
    let r = retriever(slow(0, false), slow(50, true), Some(vec![1.0, 0.0, 0.0])).await;
    let outcome = r.retrieve_detailed("q", 3, &SearchOptions::default()).await.unwrap();
    assert!(matches!(outcome.vector_error, Some(Error::BackendUnavailable(_))));
    assert!(outcome.semantic_error.is_none());
    assert_eq!(ids(&outcome.hits), ["A", "B"]);

    let r = retriever(slow(50, true), slow(0, false), Some(vec![1.0, 0.0, 0.0])).await;
    let outcome = r.retrieve_detailed("q", 3, &SearchOptions::default()).await.unwrap();
    // the semantic engine logs backend failures and returns no hits
    assert!(outcome.semantic_error.is_none());
    assert_eq!(ids(&outcome.hits), ["C", "A"]);
}

#[tokio::test]
async fn embedding_failure_empties_both_paths() {
    let r = retriever(slow(0, false), slow(0, false), None).await;
    let outcome = r.retrieve_detailed("q", 3, &SearchOptions::default()).await.unwrap();
    assert!(outcome.hits.is_empty());
    assert!(outcome.vector_error.is_some());
}

#[tokio::test]
async fn malformed_input_is_rejected_before_fan_out() {
    let r = retriever(slow(0, false), slow(0, false), Some(vec![1.0, 0.0, 0.0])).await;
    assert!(r.retrieve("", 3, &SearchOptions::default()).await.unwrap_err().is_validation());
    assert!(r.retrieve("q", 0, &SearchOptions::default()).await.unwrap_err().is_validation());
}

fn arb_hits(prefix: &'static str) -> impl Strategy<Value = Vec<SearchHit>> {
    prop::collection::vec((0u8..12, -1.0f32..1.0), 0..20).prop_map(move |items| {
        items
            .into_iter()
            .map(|(n, score)| {
                let id = format!("{prefix}{}", n % 6);
                SearchHit {
                    document: DocumentRef::new(id.clone(), id, "b", ""),
                    score,
                    rank: 0,
                    source: BackendKind::Memory,
                    provenance: Meta::new(),
                }
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn fused_output_is_unique_sorted_and_bounded(
        semantic in arb_hits("d"),
        vector in arb_hits("d"),
        sw in 0.0f32..2.0,
        vw in 0.0f32..2.0,
        top_k in 1usize..10,
    ) {
        let fused = fuse(semantic, vector, sw, vw, top_k);
        prop_assert!(fused.len() <= top_k);
        let unique: HashSet<&str> = fused.iter().map(|h| h.document.id.as_str()).collect();
        prop_assert_eq!(unique.len(), fused.len());
        prop_assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));
    }
}
