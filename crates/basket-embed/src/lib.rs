//! Embedding collaborators that need no model download.
//!
//! `HashEmbedder` is a deterministic feature-hashing embedder for offline
//! runs and tests. `CachedEmbedder` wraps any embedder with a bounded TTL
//! cache keyed by the content hash of the text.

pub mod cached;
pub mod hash;

pub use cached::CachedEmbedder;
pub use hash::HashEmbedder;

use basket_core::traits::Embedder;
use std::sync::Arc;

/// Default offline embedder with its cache in front.
pub fn default_embedder(dim: usize, max_entries: u64) -> Arc<dyn Embedder> {
    Arc::new(CachedEmbedder::new(HashEmbedder::new(dim), max_entries, std::time::Duration::from_secs(3600)))
}
