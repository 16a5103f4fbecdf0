//! REST client for a managed vector service (Pinecone-style API).
//!
//! Document content and basket id travel in the vector metadata so that hits
//! are self-describing. Every call goes through `RetryPolicy`; searches that
//! exhaust their retries come back empty, writes surface
//! `BackendUnavailable`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

use basket_core::config::ManagedConfig;
use basket_core::error::{Error, Result};
use basket_core::filters::Filters;
use basket_core::similarity::validate_documents;
use basket_core::traits::VectorIndex;
use basket_core::types::{BackendKind, DocumentRef, IndexStats, IndexedDocument, Meta, SearchHit};

use crate::retry::{RequestError, RetryPolicy};
use crate::{check_query, display_name, finish_hits};

pub const UPSERT_BATCH: usize = 100;
pub const DELETE_BATCH: usize = 1000;

const CONTENT_KEY: &str = "content";
const BASKET_KEY: &str = "basket_id";

#[derive(Debug, Serialize)]
struct UpsertVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    score: f32,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(default)]
    namespaces: std::collections::HashMap<String, NamespaceStats>,
    #[serde(default)]
    total_vector_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamespaceStats {
    #[serde(default)]
    vector_count: usize,
}

/// Translate flat equality / any-of filters into the service DSL.
pub fn to_filter_dsl(filters: &Filters) -> Option<Value> {
    let clauses: Vec<Value> = filters
        .iter()
        .map(|(k, v)| match v {
            Value::Array(items) => json!({ k: { "$in": items } }),
            other => json!({ k: { "$eq": other } }),
        })
        .collect();
    match clauses.len() {
        0 => None,
        1 => clauses.into_iter().next(),
        _ => Some(json!({ "$and": clauses })),
    }
}

fn upsert_metadata(doc: &IndexedDocument) -> Map<String, Value> {
    let mut meta: Map<String, Value> = doc.metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    meta.insert(CONTENT_KEY.into(), json!(doc.content));
    meta.insert(BASKET_KEY.into(), json!(doc.basket_id));
    meta
}

fn match_to_hit(m: QueryMatch) -> SearchHit {
    let mut metadata: Meta = m.metadata.into_iter().collect();
    let content = metadata.remove(CONTENT_KEY).and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
    let basket_id = metadata.remove(BASKET_KEY).and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
    let name = display_name(&m.id, &metadata);
    SearchHit {
        document: DocumentRef::new(m.id, name, basket_id, content),
        score: m.score,
        rank: 0,
        source: BackendKind::ManagedCloud,
        provenance: metadata,
    }
}

pub struct ManagedIndex {
    dim: usize,
    config: ManagedConfig,
    client: Client,
    retry: RetryPolicy,
}

impl ManagedIndex {
    pub fn new(dim: usize, config: ManagedConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::InvalidConfig("managed.base_url is empty".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {e}")))?;
        let retry = RetryPolicy::from_config(&config);
        Ok(Self { dim, config, client, retry })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_once(&self, path: &str, body: &Value) -> std::result::Result<Value, RequestError> {
        let resp = self
            .client
            .post(self.url(path))
            .header("Api-Key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| RequestError::from_transport(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RequestError::from_status(status, &text));
        }
        resp.json::<Value>().await.map_err(|e| RequestError::Fatal(format!("decode {path}: {e}")))
    }

    async fn post(&self, path: &str, body: Value) -> std::result::Result<Value, RequestError> {
        self.retry.execute(path, || self.post_once(path, &body)).await
    }

    async fn write(&self, path: &str, body: Value) -> Result<Value> {
        self.post(path, body).await.map_err(|e| Error::unavailable(format!("{path}: {e}")))
    }
}

#[async_trait]
impl VectorIndex for ManagedIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::ManagedCloud
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn initialize(&self) -> Result<()> {
        // connectivity check; a failure here is reported but not fatal for reads later
        self.write("describe_index_stats", json!({})).await?;
        tracing::info!(url = %self.config.base_url, namespace = %self.config.namespace, "managed index reachable");
        Ok(())
    }

    async fn add(&self, documents: &[IndexedDocument]) -> Result<()> {
        validate_documents(documents, self.dim)?;
        for (i, batch) in documents.chunks(UPSERT_BATCH).enumerate() {
            let vectors: Vec<UpsertVector<'_>> = batch
                .iter()
                .map(|d| UpsertVector { id: &d.id, values: &d.embedding, metadata: upsert_metadata(d) })
                .collect();
            self.write("vectors/upsert", json!({ "vectors": vectors, "namespace": self.config.namespace })).await?;
            tracing::debug!(batch = i, size = batch.len(), "upserted batch");
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
        let mut body = json!({
            "vector": embedding,
            "topK": top_k,
            "includeMetadata": true,
            "namespace": self.config.namespace,
        });
        if let Some(dsl) = filters.and_then(to_filter_dsl) {
            body["filter"] = dsl;
        }
        let raw = match self.post("query", body).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "managed search failed; returning no hits");
                return Ok(Vec::new());
            }
        };
        let parsed: QueryResponse = match serde_json::from_value(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "unexpected managed query response");
                return Ok(Vec::new());
            }
        };
        let hits = parsed
            .matches
            .into_iter()
            .filter(|m| min_similarity.map_or(true, |min| m.score >= min))
            .map(match_to_hit)
            .collect();
        Ok(finish_hits(hits, top_k))
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        for batch in ids.chunks(DELETE_BATCH) {
            self.write("vectors/delete", json!({ "ids": batch, "namespace": self.config.namespace })).await?;
        }
        // the service does not report how many ids existed
        Ok(ids.len())
    }

    async fn update(&self, document: &IndexedDocument) -> Result<()> {
        self.add(std::slice::from_ref(document)).await
    }

    async fn count(&self) -> Result<usize> {
        let raw = self.write("describe_index_stats", json!({})).await?;
        let stats: StatsResponse = serde_json::from_value(raw)?;
        Ok(stats.namespaces.get(&self.config.namespace).map_or(stats.total_vector_count, |ns| ns.vector_count))
    }

    async fn stats(&self) -> Result<IndexStats> {
        let documents = self.count().await?;
        let mut details = Meta::new();
        details.insert("base_url".into(), json!(self.config.base_url));
        details.insert("namespace".into(), json!(self.config.namespace));
        details.insert("max_attempts".into(), json!(self.retry.max_attempts));
        Ok(IndexStats { backend: BackendKind::ManagedCloud, documents, dimension: self.dim, details })
    }
}
