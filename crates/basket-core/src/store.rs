//! In-process document collaborator backed by a concurrent map.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::traits::DocumentStore;
use crate::types::Document;

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, Document>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let store = Self::new();
        for d in documents {
            store.insert(d);
        }
        store
    }

    /// Insert or replace by id.
    pub fn insert(&self, document: Document) {
        self.documents.insert(document.id.clone(), document);
    }

    pub fn remove(&self, id: &str) -> Option<Document> {
        self.documents.remove(id).map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>> {
        Ok(self.documents.get(id).map(|d| d.value().clone()))
    }

    async fn list_by_basket(&self, basket_id: &str) -> anyhow::Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|d| d.basket_id == basket_id)
            .map(|d| d.value().clone())
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}
