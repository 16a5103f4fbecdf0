use std::fs;
use tempfile::TempDir;

use basket_core::config::{LocalIndexKind, Metric, RagConfig};
use basket_core::store::MemoryDocumentStore;
use basket_core::traits::DocumentStore;
use basket_core::types::{AnswerStyle, BackendKind, Document, Meta};

#[test]
fn load_merges_base_and_env_files() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(
        dir.join("config.toml"),
        r#"
vector_backend_type = "local-index"
top_k_documents = 8
answer_style = "bullet_points"

[local_index]
path = "indexes/local"
kind = "graph"
metric = "euclidean"
"#,
    )
    .unwrap();
    fs::write(dir.join("config.test.toml"), "top_k_documents = 3\ncache_ttl_seconds = 60\n").unwrap();

    let config = RagConfig::load_from(dir, "test").expect("load");
    assert_eq!(config.vector_backend_type, BackendKind::LocalIndex);
    assert_eq!(config.top_k_documents, 3, "env file overrides base file");
    assert_eq!(config.cache_ttl_seconds, 60);
    assert_eq!(config.answer_style, AnswerStyle::BulletPoints);
    let local = config.local_index.as_ref().expect("local section");
    assert_eq!(local.kind, LocalIndexKind::Graph);
    assert_eq!(local.metric, Metric::Euclidean);
    assert_eq!(local.resolved_path(dir), Some(dir.join("indexes/local")));
    // untouched keys keep their defaults
    assert_eq!(config.max_context_tokens, RagConfig::default().max_context_tokens);
}

#[test]
fn missing_files_fall_back_to_defaults() {
    let tmp = TempDir::new().unwrap();
    let config = RagConfig::load_from(tmp.path(), "prod").expect("defaults");
    assert_eq!(config, RagConfig::default());
}

#[test]
fn validation_rejects_inconsistent_settings() {
    let mut config = RagConfig { vector_backend_type: BackendKind::Relational, ..RagConfig::default() };
    assert!(config.validate().is_err(), "relational backend without its section");

    config = RagConfig { min_similarity: 1.5, ..RagConfig::default() };
    assert!(config.validate().is_err());

    config = RagConfig { top_k_documents: 0, ..RagConfig::default() };
    assert!(config.validate().is_err());

    config = RagConfig { semantic_weight: -0.1, ..RagConfig::default() };
    assert!(config.validate().is_err());

    assert!(RagConfig::default().validate().is_ok());
}

#[tokio::test]
async fn memory_store_lists_by_basket() {
    let doc = |id: &str, basket: &str| Document {
        id: id.to_string(),
        name: format!("{id}.txt"),
        content: format!("content of {id}"),
        basket_id: basket.to_string(),
        metadata: Meta::new(),
    };
    let store = MemoryDocumentStore::from_documents([doc("b", "one"), doc("a", "one"), doc("c", "two")]);
    let listed = store.list_by_basket("one").await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);
    assert!(store.get_document("c").await.unwrap().is_some());
    store.remove("c");
    assert!(store.get_document("c").await.unwrap().is_none());
}
