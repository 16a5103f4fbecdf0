//! Wiring shared by the `basket` binary: corpus loading, bulk indexing and
//! an offline completer.

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use std::path::Path;

use basket_core::traits::{Completer, Embedder, VectorIndex};
use basket_core::types::{CompletionRequest, Document, IndexedDocument};

/// Embeddings requested concurrently while indexing.
pub const EMBED_CONCURRENCY: usize = 8;
pub const ADD_BATCH: usize = 64;

/// Read one `Document` per non-blank line.
pub fn read_documents(path: &Path) -> anyhow::Result<Vec<Document>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: not a document record", path.display(), i + 1))
        })
        .collect()
}

/// Embed and add `documents`. Returns how many were indexed; documents the
/// embedder produced nothing for are skipped.
pub async fn index_documents(
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    documents: &[Document],
    progress: &ProgressBar,
) -> anyhow::Result<usize> {
    let mut embedded = stream::iter(documents)
        .map(|doc| async move { (doc, embedder.embed(&doc.content).await) })
        .buffered(EMBED_CONCURRENCY);

    let mut batch = Vec::with_capacity(ADD_BATCH);
    let mut indexed = 0;
    while let Some((doc, result)) = embedded.next().await {
        progress.inc(1);
        match result {
            Ok(Some(embedding)) => batch.push(IndexedDocument {
                id: doc.id.clone(),
                content: doc.content.clone(),
                embedding,
                basket_id: doc.basket_id.clone(),
                metadata: doc.metadata.clone(),
            }),
            Ok(None) => tracing::warn!(id = %doc.id, "no embedding produced; skipping"),
            Err(e) => tracing::warn!(id = %doc.id, error = %e, "embedding failed; skipping"),
        }
        if batch.len() == ADD_BATCH {
            index.add(&batch).await?;
            indexed += batch.len();
            batch.clear();
        }
    }
    if !batch.is_empty() {
        index.add(&batch).await?;
        indexed += batch.len();
    }
    Ok(indexed)
}

/// Answers by quoting the opening of the best-ranked document in the prompt.
pub struct ExtractiveCompleter {
    pub max_chars: usize,
}

impl Default for ExtractiveCompleter {
    fn default() -> Self {
        Self { max_chars: 400 }
    }
}

#[async_trait]
impl Completer for ExtractiveCompleter {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        let documents = request
            .prompt
            .split_once("## Documents")
            .and_then(|(_, rest)| rest.split_once("## Question"))
            .map(|(docs, _)| docs.trim())
            .context("prompt carries no documents section")?;
        let first = documents.split("\n\nDocument ").next().unwrap_or(documents);
        let Some((header, body)) = first.split_once('\n') else {
            return Ok("I don't know.".into());
        };
        let name = header.split_once("): ").map_or(header, |(_, n)| n);
        let excerpt = first_sentence(body.trim(), self.max_chars);
        if excerpt.is_empty() {
            return Ok("I don't know.".into());
        }
        Ok(format!("Based on {name}: {excerpt}"))
    }
}

fn first_sentence(text: &str, max_chars: usize) -> String {
    let end = text.find(['.', '!', '?']).map_or(text.len(), |i| i + 1);
    text[..end].chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use basket_core::config::MemoryConfig;
    use basket_embed::HashEmbedder;
    use basket_vector::MemoryIndex;
    use std::io::Write;

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest { prompt: prompt.into(), max_tokens: 100, temperature: 0.0, system_prompt: None }
    }

    #[test]
    fn reads_jsonl_and_reports_bad_lines() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, r#"{{"id":"a","name":"a.md","content":"alpha","basket_id":"b"}}"#).unwrap();
        writeln!(f).unwrap();
        let with_meta = r#"{"id":"b","name":"b.md","content":"beta","basket_id":"b","metadata":{"lang":"en"}}"#;
        writeln!(f, "{with_meta}").unwrap();
        let docs = read_documents(f.path()).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].metadata.get("lang"), Some(&serde_json::json!("en")));

        writeln!(f, "not json").unwrap();
        let err = read_documents(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains(":4:"));
    }

    #[tokio::test]
    async fn indexes_in_batches() {
        let index = MemoryIndex::new(32, MemoryConfig::default());
        let embedder = HashEmbedder::new(32);
        let docs: Vec<Document> = (0..150)
            .map(|i| Document {
                id: format!("d{i}"),
                name: format!("d{i}"),
                content: format!("document number {i}"),
                basket_id: "b".into(),
                metadata: Default::default(),
            })
            .collect();
        let progress = ProgressBar::hidden();
        assert_eq!(index_documents(&index, &embedder, &docs, &progress).await.unwrap(), 150);
        assert_eq!(index.count().await.unwrap(), 150);
        assert_eq!(progress.position(), 150);
    }

    #[tokio::test]
    async fn extractive_completer_quotes_the_top_document() {
        let prompt = "Use the following documents.\n\n## Documents\n\n\
                      Document 1 (similarity=0.900): soil.md\nCompost feeds the soil. It also holds water.\n\n\
                      Document 2 (similarity=0.500): rain.md\nRain barrels.\n\n\
                      ## Question\n\nWhat feeds soil?";
        let answer = ExtractiveCompleter::default().complete(&request(prompt)).await.unwrap();
        assert_eq!(answer, "Based on soil.md: Compost feeds the soil.");
        assert!(ExtractiveCompleter::default().complete(&request("no sections")).await.is_err());
    }
}
