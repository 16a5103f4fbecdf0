//! Postgres + pgvector backend.
//!
//! Every value that comes from a caller (embedding, basket id, filter keys
//! and values, thresholds, limits) is a bound parameter. The only
//! interpolated token is the table name, validated as an identifier once at
//! construction.
//!
//! Scores are `1 - cosine distance` as computed by the `<=>` operator.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::OnceCell;

use basket_core::config::RelationalConfig;
use basket_core::error::{Error, Result};
use basket_core::filters::{Filters, BASKET_FILTER_KEY};
use basket_core::similarity::{validate_basket_id, validate_documents};
use basket_core::traits::VectorIndex;
use basket_core::types::{BackendKind, DocumentRef, IndexStats, IndexedDocument, Meta, SearchHit};

use crate::{check_query, display_name, finish_hits};

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    TextArray(Vec<String>),
    Float(f64),
    Int(i64),
}

/// SQL text plus its positional parameters (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl SqlQuery {
    fn push(&mut self, p: SqlParam) -> usize {
        self.params.push(p);
        self.params.len()
    }
}

/// pgvector literal: `[0.1,0.2,...]`.
pub fn vector_literal(embedding: &[f32]) -> String {
    let parts: Vec<String> = embedding.iter().map(f32::to_string).collect();
    format!("[{}]", parts.join(","))
}

pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if first_ok && name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("invalid table name '{name}'")))
    }
}

/// Build the similarity query. `embedding` must already be validated.
pub fn build_search_query(
    table: &str,
    embedding: &[f32],
    top_k: usize,
    filters: Option<&Filters>,
    min_similarity: Option<f32>,
) -> Result<SqlQuery> {
    basket_core::similarity::validate_top_k(top_k)?;
    validate_table_name(table)?;
    let mut q = SqlQuery { sql: String::new(), params: Vec::new() };
    let v = q.push(SqlParam::Text(vector_literal(embedding)));
    let mut sql = format!(
        "SELECT id, content, basket_id, metadata::text AS metadata, \
         (1 - (embedding <=> ${v}::vector))::float8 AS similarity FROM {table} WHERE TRUE"
    );

    if let Some(filters) = filters {
        let mut contained = serde_json::Map::new();
        for (key, expected) in filters {
            if key == BASKET_FILTER_KEY {
                let baskets = basket_values(expected)?;
                let n = q.push(SqlParam::TextArray(baskets));
                sql.push_str(&format!(" AND basket_id = ANY(${n}::text[])"));
            } else if let Value::Array(_) = expected {
                let k = q.push(SqlParam::Text(key.clone()));
                let n = q.push(SqlParam::Text(expected.to_string()));
                sql.push_str(&format!(" AND ${n}::jsonb @> (metadata -> ${k})"));
            } else {
                contained.insert(key.clone(), expected.clone());
            }
        }
        if !contained.is_empty() {
            let n = q.push(SqlParam::Text(Value::Object(contained).to_string()));
            sql.push_str(&format!(" AND metadata @> ${n}::jsonb"));
        }
    }

    if let Some(min) = min_similarity {
        let n = q.push(SqlParam::Float(f64::from(min)));
        sql.push_str(&format!(" AND (1 - (embedding <=> ${v}::vector)) >= ${n}"));
    }
    let limit = q.push(SqlParam::Int(i64::try_from(top_k).unwrap_or(i64::MAX)));
    sql.push_str(&format!(" ORDER BY embedding <=> ${v}::vector LIMIT ${limit}"));
    q.sql = sql;
    Ok(q)
}

fn basket_values(expected: &Value) -> Result<Vec<String>> {
    let raw: Vec<&Value> = match expected {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    raw.into_iter()
        .map(|v| {
            let s = v.as_str().ok_or_else(|| Error::validation("basket id filter must be a string"))?;
            validate_basket_id(s)?;
            Ok(s.to_string())
        })
        .collect()
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_all<'q>(mut query: PgQuery<'q>, params: &'q [SqlParam]) -> PgQuery<'q> {
    for p in params {
        query = match p {
            SqlParam::Text(s) => query.bind(s.as_str()),
            SqlParam::TextArray(v) => query.bind(v.as_slice()),
            SqlParam::Float(f) => query.bind(*f),
            SqlParam::Int(i) => query.bind(*i),
        };
    }
    query
}

fn db_err(context: &str, e: &sqlx::Error) -> Error {
    Error::unavailable(format!("{context}: {e}"))
}

pub struct PgVectorIndex {
    dim: usize,
    config: RelationalConfig,
    pool: OnceCell<PgPool>,
}

impl PgVectorIndex {
    pub fn new(dim: usize, config: RelationalConfig) -> Result<Self> {
        validate_table_name(&config.table)?;
        Ok(Self { dim, config, pool: OnceCell::new() })
    }

    fn pool(&self) -> Result<&PgPool> {
        self.pool.get().ok_or_else(|| Error::unavailable("relational index not initialized"))
    }

    fn upsert_query(&self) -> String {
        format!(
            "INSERT INTO {t} (id, content, basket_id, metadata, embedding) VALUES ($1, $2, $3, $4::jsonb, $5::vector) \
             ON CONFLICT (id) DO UPDATE SET content = EXCLUDED.content, basket_id = EXCLUDED.basket_id, \
             metadata = EXCLUDED.metadata, embedding = EXCLUDED.embedding",
            t = self.config.table
        )
    }

    fn row_to_hit(row: &PgRow) -> std::result::Result<SearchHit, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let content: String = row.try_get("content")?;
        let basket_id: String = row.try_get("basket_id")?;
        let metadata_text: String = row.try_get("metadata")?;
        let similarity: f64 = row.try_get("similarity")?;
        let metadata: Meta = serde_json::from_str(&metadata_text).unwrap_or_default();
        #[allow(clippy::cast_possible_truncation)]
        let score = similarity as f32;
        Ok(SearchHit {
            document: DocumentRef::new(id.clone(), display_name(&id, &metadata), basket_id, content),
            score,
            rank: 0,
            source: BackendKind::Relational,
            provenance: metadata,
        })
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn initialize(&self) -> Result<()> {
        let pool = self
            .pool
            .get_or_try_init(|| async {
                PgPoolOptions::new()
                    .max_connections(self.config.max_connections)
                    .connect(&self.config.url)
                    .await
                    .map_err(|e| db_err("connect", &e))
            })
            .await?;
        let t = &self.config.table;
        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS {t} (id TEXT PRIMARY KEY, content TEXT NOT NULL, basket_id TEXT NOT NULL, \
                 metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb, embedding vector({}) NOT NULL)",
                self.dim
            ),
            format!("CREATE INDEX IF NOT EXISTS {t}_basket_idx ON {t} (basket_id)"),
        ];
        for stmt in &statements {
            sqlx::query(stmt).execute(pool).await.map_err(|e| db_err("schema", &e))?;
        }
        tracing::info!(table = %t, dim = self.dim, "relational index ready");
        Ok(())
    }

    async fn add(&self, documents: &[IndexedDocument]) -> Result<()> {
        validate_documents(documents, self.dim)?;
        if documents.is_empty() {
            return Ok(());
        }
        let pool = self.pool()?;
        let sql = self.upsert_query();
        let mut tx = pool.begin().await.map_err(|e| db_err("begin", &e))?;
        for d in documents {
            let metadata = serde_json::to_string(&d.metadata)?;
            sqlx::query(&sql)
                .bind(&d.id)
                .bind(&d.content)
                .bind(&d.basket_id)
                .bind(metadata)
                .bind(vector_literal(&d.embedding))
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("insert", &e))?;
        }
        tx.commit().await.map_err(|e| db_err("commit", &e))?;
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
        let query = build_search_query(&self.config.table, embedding, top_k, filters, min_similarity)?;
        let pool = match self.pool() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "relational search skipped");
                return Ok(Vec::new());
            }
        };
        let rows = match bind_all(sqlx::query(&query.sql), &query.params).fetch_all(pool).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "relational search failed; returning no hits");
                return Ok(Vec::new());
            }
        };
        let hits = rows
            .iter()
            .filter_map(|r| {
                Self::row_to_hit(r).map_err(|e| tracing::warn!(error = %e, "skipping undecodable row")).ok()
            })
            .collect();
        Ok(finish_hits(hits, top_k))
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE id = ANY($1::text[])", self.config.table);
        let done = sqlx::query(&sql).bind(ids).execute(self.pool()?).await.map_err(|e| db_err("delete", &e))?;
        Ok(usize::try_from(done.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn update(&self, document: &IndexedDocument) -> Result<()> {
        validate_documents(std::slice::from_ref(document), self.dim)?;
        let sql = format!(
            "UPDATE {} SET content = $2, basket_id = $3, metadata = $4::jsonb, embedding = $5::vector WHERE id = $1",
            self.config.table
        );
        let done = sqlx::query(&sql)
            .bind(&document.id)
            .bind(&document.content)
            .bind(&document.basket_id)
            .bind(serde_json::to_string(&document.metadata)?)
            .bind(vector_literal(&document.embedding))
            .execute(self.pool()?)
            .await
            .map_err(|e| db_err("update", &e))?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(document.id.clone()));
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*)::bigint AS n FROM {}", self.config.table);
        let row = sqlx::query(&sql).fetch_one(self.pool()?).await.map_err(|e| db_err("count", &e))?;
        let n: i64 = row.try_get("n").map_err(|e| db_err("count", &e))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn stats(&self) -> Result<IndexStats> {
        let documents = self.count().await?;
        let mut details = Meta::new();
        details.insert("table".into(), json!(self.config.table));
        details.insert("distance".into(), json!("cosine"));
        Ok(IndexStats { backend: BackendKind::Relational, documents, dimension: self.dim, details })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_query_binds_every_caller_value() {
        let mut filters = Filters::new();
        filters.insert(BASKET_FILTER_KEY.into(), json!("team-a"));
        filters.insert("lang".into(), json!("en"));
        filters.insert("year".into(), json!([2023, 2024]));
        let q = build_search_query("docs", &[0.5, 0.25], 7, Some(&filters), Some(0.4)).expect("query");

        assert!(!q.sql.contains("team-a"));
        assert!(!q.sql.contains("en\""));
        assert!(!q.sql.contains("2023"));
        assert!(q.sql.contains("basket_id = ANY($2::text[])"));
        assert!(q.sql.contains("LIMIT $7"));
        assert_eq!(q.params[0], SqlParam::Text("[0.5,0.25]".into()));
        assert_eq!(q.params[1], SqlParam::TextArray(vec!["team-a".into()]));
        assert_eq!(q.params.last(), Some(&SqlParam::Int(7)));
        assert!(q.params.contains(&SqlParam::Float(f64::from(0.4f32))));
    }

    #[test]
    fn search_query_rejects_bad_input() {
        assert!(build_search_query("docs", &[1.0], 0, None, None).unwrap_err().is_validation());
        let mut filters = Filters::new();
        filters.insert(BASKET_FILTER_KEY.into(), json!("a'; DROP TABLE docs; --"));
        assert!(build_search_query("docs", &[1.0], 3, Some(&filters), None).unwrap_err().is_validation());
        assert!(build_search_query("docs; DROP", &[1.0], 3, None, None).is_err());
    }

    #[test]
    fn minimal_query_shape() {
        let q = build_search_query("basket_embeddings", &[1.0, 0.0], 2, None, None).expect("query");
        assert_eq!(q.params.len(), 2);
        assert!(q.sql.ends_with("ORDER BY embedding <=> $1::vector LIMIT $2"));
    }

    #[test]
    fn table_names_are_identifiers() {
        assert!(validate_table_name("basket_embeddings").is_ok());
        assert!(validate_table_name("1table").is_err());
        assert!(validate_table_name("a-b").is_err());
    }
}
