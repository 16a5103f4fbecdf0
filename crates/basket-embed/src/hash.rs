use anyhow::Result;
use async_trait::async_trait;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

use basket_core::similarity::l2_normalize;
use basket_core::traits::Embedder;
use basket_core::types::Embedding;

/// Bag-of-words feature hashing: each lowercased token bumps one bucket.
/// Texts sharing vocabulary land close together under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Empty when `dim` is zero: there is no bucket to hash into.
    pub fn embed_sync(&self, text: &str) -> Embedding {
        if self.dim == 0 {
            return Vec::new();
        }
        let mut v = vec![0f32; self.dim];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let mut hasher = XxHash64::with_seed(0);
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            // top bit picks the sign so unrelated tokens partly cancel
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign * (0.5 + ((h >> 32) as u32) as f32 / u32::MAX as f32);
        }
        l2_normalize(&v)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Option<Embedding>> {
        if self.dim == 0 || text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(self.embed_sync(text)))
    }
}
