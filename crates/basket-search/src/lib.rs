//! Semantic search over one `VectorIndex`, with a TTL query cache.

pub mod cache;
pub mod engine;

pub use cache::{cache_key, CacheEntry, QueryCache};
pub use engine::{SearchOptions, SemanticSearchEngine};
