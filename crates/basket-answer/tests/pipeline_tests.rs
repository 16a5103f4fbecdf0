use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use basket_answer::pipeline::NO_RELEVANT_DOCUMENTS;
use basket_answer::synth::confidence;
use basket_answer::{ContextAssembler, QueryStage, RagPipeline};
use basket_core::config::{MemoryConfig, RagConfig};
use basket_core::store::MemoryDocumentStore;
use basket_core::traits::{Completer, Embedder, VectorIndex};
use basket_core::types::{
    BackendKind, CompletionRequest, Document, DocumentRef, Embedding, IndexedDocument, Meta, SearchHit,
};
use basket_hybrid::HybridRetriever;
use basket_search::{SearchOptions, SemanticSearchEngine};
use basket_vector::MemoryIndex;

struct TableEmbedder;

#[async_trait]
impl Embedder for TableEmbedder {
    fn dim(&self) -> usize {
        3
    }
    async fn embed(&self, text: &str) -> anyhow::Result<Option<Embedding>> {
        Ok(match text {
            "x axis" => Some(vec![1.0, 0.0, 0.0]),
            "y axis" => Some(vec![0.0, 1.0, 0.0]),
            _ => anyhow::bail!("embedding service down"),
        })
    }
}

/// `TableEmbedder` that counts calls and can be switched off.
#[derive(Default)]
struct SwitchableEmbedder {
    calls: AtomicUsize,
    down: AtomicBool,
}

#[async_trait]
impl Embedder for SwitchableEmbedder {
    fn dim(&self) -> usize {
        3
    }
    async fn embed(&self, text: &str) -> anyhow::Result<Option<Embedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("embedding service down");
        }
        TableEmbedder.embed(text).await
    }
}

/// Answers with a fixed text, or fails, and counts calls.
struct ScriptedCompleter {
    reply: Option<&'static str>,
    calls: AtomicUsize,
}

impl ScriptedCompleter {
    fn replying(reply: &'static str) -> Arc<Self> {
        Arc::new(Self { reply: Some(reply), calls: AtomicUsize::new(0) })
    }
    fn failing() -> Arc<Self> {
        Arc::new(Self { reply: None, calls: AtomicUsize::new(0) })
    }
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Completer for ScriptedCompleter {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(request.prompt.contains("## Question"));
        match self.reply {
            Some(r) => Ok(r.to_string()),
            None => anyhow::bail!("model overloaded"),
        }
    }
}

fn config() -> RagConfig {
    RagConfig { min_similarity: 0.0, embedding_dimension: 3, include_citations: false, ..RagConfig::default() }
}

async fn engine(config: &RagConfig) -> Arc<SemanticSearchEngine> {
    engine_with(config, Arc::new(TableEmbedder)).await
}

async fn engine_with(config: &RagConfig, embedder: Arc<dyn Embedder>) -> Arc<SemanticSearchEngine> {
    let index = Arc::new(MemoryIndex::new(3, MemoryConfig::default()));
    let store = Arc::new(MemoryDocumentStore::new());
    for (id, emb) in [("A", [1.0, 0.0, 0.0]), ("B", [0.0, 1.0, 0.0]), ("C", [0.9, 0.1, 0.0])] {
        store.insert(Document {
            id: id.into(),
            name: format!("{id}.md"),
            content: format!("text {id}"),
            basket_id: "b1".into(),
            metadata: Meta::new(),
        });
        let indexed = IndexedDocument {
            id: id.into(),
            content: format!("text {id}"),
            embedding: emb.to_vec(),
            basket_id: "b1".into(),
            metadata: Meta::new(),
        };
        index.add(&[indexed]).await.unwrap();
    }
    Arc::new(SemanticSearchEngine::new(config, index, embedder, store))
}

async fn pipeline(config: RagConfig, completer: Arc<ScriptedCompleter>) -> RagPipeline {
    let engine = engine(&config).await;
    RagPipeline::new(Arc::new(config), engine, completer)
}

fn ids(hits: &[SearchHit]) -> Vec<&str> {
    hits.iter().map(|h| h.document.id.as_str()).collect()
}

#[tokio::test]
async fn answers_from_ranked_sources() {
    let completer = ScriptedCompleter::replying("Based on the documents, the x axis points east.");
    let p = pipeline(config(), completer.clone()).await;
    let answer = p.answer_with("x axis", 3, &SearchOptions::default()).await.unwrap();

    assert_eq!(answer.query, "x axis");
    assert_eq!(answer.answer, "Based on the documents, the x axis points east.");
    assert_eq!(ids(&answer.sources), ["A", "C", "B"]);
    assert!(answer.confidence > 0.0 && answer.confidence <= 1.0);
    assert_eq!(answer.metadata.get("retrieval"), Some(&json!("semantic")));
    assert_eq!(answer.metadata.get("cache_hit"), Some(&json!(false)));
    assert_eq!(answer.metadata.get("context_documents"), Some(&json!(3)));
    assert_eq!(completer.calls(), 1);
}

#[tokio::test]
async fn citations_are_appended_when_enabled() {
    let p = pipeline(RagConfig { include_citations: true, ..config() }, ScriptedCompleter::replying("East.")).await;
    let answer = p.answer_with("x axis", 1, &SearchOptions::default()).await.unwrap();
    assert_eq!(answer.answer, "East.\n\nSources:\n1. A.md (similarity: 1.00)");
}

#[tokio::test]
async fn embedding_failure_gives_a_no_documents_answer() {
    let completer = ScriptedCompleter::replying("unused");
    let p = pipeline(config(), completer.clone()).await;
    let answer = p.answer_with("something else", 3, &SearchOptions::default()).await.unwrap();

    assert_eq!(answer.answer, NO_RELEVANT_DOCUMENTS);
    assert_eq!(answer.confidence, 0.0);
    assert!(answer.sources.is_empty());
    assert_eq!(answer.metadata.get("failed_stage"), Some(&json!(QueryStage::Embedding.as_str())));
    assert_eq!(completer.calls(), 0);
}

#[tokio::test]
async fn an_empty_basket_gives_a_no_documents_answer() {
    let completer = ScriptedCompleter::replying("unused");
    let p = pipeline(config(), completer.clone()).await;
    let answer = p.answer_with("x axis", 3, &SearchOptions::in_basket("empty")).await.unwrap();
    assert_eq!(answer.answer, NO_RELEVANT_DOCUMENTS);
    assert_eq!(answer.confidence, 0.0);
    assert_eq!(completer.calls(), 0);
}

#[tokio::test]
async fn synthesis_failure_degrades_and_is_not_cached() {
    let completer = ScriptedCompleter::failing();
    let p = pipeline(config(), completer.clone()).await;
    let answer = p.answer_with("x axis", 3, &SearchOptions::default()).await.unwrap();

    assert_eq!(answer.confidence, 0.0);
    assert!(answer.sources.is_empty());
    assert!(answer.answer.contains("model overloaded"));
    assert_eq!(answer.metadata.get("failed_stage"), Some(&json!("synthesis")));

    p.answer_with("x axis", 3, &SearchOptions::default()).await.unwrap();
    assert_eq!(completer.calls(), 2);
}

#[tokio::test]
async fn retry_after_failed_synthesis_skips_embedding() {
    let config = config();
    let embedder = Arc::new(SwitchableEmbedder::default());
    let engine = engine_with(&config, embedder.clone()).await;
    let completer = ScriptedCompleter::failing();
    let p = RagPipeline::new(Arc::new(config), engine, completer.clone());

    p.answer_with("x axis", 3, &SearchOptions::default()).await.unwrap();
    p.answer_with("x axis", 3, &SearchOptions::default()).await.unwrap();
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(completer.calls(), 2);

    let uncached = SearchOptions { use_cache: false, ..SearchOptions::default() };
    p.answer_with("x axis", 3, &uncached).await.unwrap();
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn warm_search_cache_answers_while_embedding_is_down() {
    let config = config();
    let embedder = Arc::new(SwitchableEmbedder::default());
    let engine = engine_with(&config, embedder.clone()).await;
    engine.search("x axis", 2, &SearchOptions::default()).await.unwrap();
    embedder.down.store(true, Ordering::SeqCst);

    let completer = ScriptedCompleter::replying("East.");
    let p = RagPipeline::new(Arc::new(config), engine, completer.clone());
    let answer = p.answer_with("x axis", 2, &SearchOptions::default()).await.unwrap();
    assert_eq!(answer.answer, "East.");
    assert_eq!(ids(&answer.sources), ["A", "C"]);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

    let cold = p.answer_with("y axis", 2, &SearchOptions::default()).await.unwrap();
    assert_eq!(cold.metadata.get("failed_stage"), Some(&json!("embedding")));
}

#[tokio::test]
async fn repeated_questions_are_served_from_cache() {
    let completer = ScriptedCompleter::replying("East.");
    let p = pipeline(config(), completer.clone()).await;
    let first = p.answer_with("x axis", 2, &SearchOptions::default()).await.unwrap();
    let second = p.answer_with("x axis", 2, &SearchOptions::default()).await.unwrap();

    assert_eq!(completer.calls(), 1);
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.sources, first.sources);
    assert_eq!(second.metadata.get("cache_hit"), Some(&json!(true)));

    let uncached = SearchOptions { use_cache: false, ..SearchOptions::default() };
    p.answer_with("x axis", 2, &uncached).await.unwrap();
    assert_eq!(completer.calls(), 2);

    p.clear_caches();
    p.answer_with("x axis", 2, &SearchOptions::default()).await.unwrap();
    assert_eq!(completer.calls(), 3);
}

#[tokio::test]
async fn cached_answers_expire() {
    let completer = ScriptedCompleter::replying("East.");
    let p = pipeline(RagConfig { cache_ttl_seconds: 1, ..config() }, completer.clone()).await;
    p.answer_with("x axis", 2, &SearchOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let again = p.answer_with("x axis", 2, &SearchOptions::default()).await.unwrap();
    assert_eq!(again.metadata.get("cache_hit"), Some(&json!(false)));
    assert_eq!(completer.calls(), 2);
}

#[tokio::test]
async fn basket_invalidation_drops_cached_answers() {
    let completer = ScriptedCompleter::replying("North.");
    let p = pipeline(config(), completer.clone()).await;
    p.answer_with("y axis", 2, &SearchOptions::in_basket("b1")).await.unwrap();
    p.invalidate_basket("b1");
    p.answer_with("y axis", 2, &SearchOptions::in_basket("b1")).await.unwrap();
    assert_eq!(completer.calls(), 2);
}

#[tokio::test]
async fn hybrid_mode_fuses_the_second_index() {
    let config = RagConfig { hybrid_search: true, ..config() };
    let engine = engine(&config).await;
    let secondary = Arc::new(MemoryIndex::new(3, MemoryConfig::default()));
    secondary
        .add(&[IndexedDocument {
            id: "E".into(),
            content: "text E".into(),
            embedding: vec![1.0, 0.0, 0.0],
            basket_id: "b1".into(),
            metadata: Meta::new(),
        }])
        .await
        .unwrap();
    let retriever = Arc::new(HybridRetriever::new(&config, engine.clone(), secondary));
    let p = RagPipeline::new(Arc::new(config), engine, ScriptedCompleter::replying("East.")).with_hybrid(retriever);

    let answer = p.answer_with("x axis", 3, &SearchOptions::default()).await.unwrap();
    assert_eq!(answer.metadata.get("retrieval"), Some(&json!("hybrid")));
    // A: 1.0 * 0.7, C: 0.994 * 0.7, E: 1.0 * 0.3
    assert_eq!(ids(&answer.sources), ["A", "C", "E"]);
}

#[tokio::test]
async fn hybrid_retriever_is_ignored_when_disabled() {
    let config = config();
    let engine = engine(&config).await;
    let secondary = Arc::new(MemoryIndex::new(3, MemoryConfig::default()));
    let retriever = Arc::new(HybridRetriever::new(&config, engine.clone(), secondary));
    let p = RagPipeline::new(Arc::new(config), engine, ScriptedCompleter::replying("East.")).with_hybrid(retriever);
    let answer = p.answer_with("x axis", 1, &SearchOptions::default()).await.unwrap();
    assert_eq!(answer.metadata.get("retrieval"), Some(&json!("semantic")));
}

#[tokio::test]
async fn malformed_questions_are_rejected() {
    let p = pipeline(config(), ScriptedCompleter::replying("East.")).await;
    assert!(p.answer(" ", None).await.unwrap_err().is_validation());
    assert!(p.answer_with("x axis", 0, &SearchOptions::default()).await.unwrap_err().is_validation());
    assert!(p.answer_with("x axis", 1001, &SearchOptions::default()).await.unwrap_err().is_validation());
    assert!(p.answer("x axis", Some("no such/basket")).await.unwrap_err().is_validation());
}

fn arb_hits() -> impl Strategy<Value = Vec<SearchHit>> {
    prop::collection::vec(("[a-z]{1,8}", "[a-z ]{0,400}", -1.0f32..1.0), 0..12).prop_map(|items| {
        items
            .into_iter()
            .map(|(name, content, score)| SearchHit {
                document: DocumentRef::new(name.clone(), name, "b", content),
                score,
                rank: 0,
                source: BackendKind::Memory,
                provenance: Meta::new(),
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn confidence_stays_in_unit_range(hits in arb_hits(), answer in ".{0,80}") {
        let c = confidence(&hits, &answer);
        prop_assert!((0.0..=1.0).contains(&c));
    }

    #[test]
    fn context_never_exceeds_its_budget(hits in arb_hits(), max_tokens in 1usize..400) {
        let ctx = ContextAssembler::new(max_tokens).assemble(&hits);
        prop_assert!(ctx.tokens <= max_tokens);
        prop_assert!(ctx.documents <= hits.len());
    }
}
