#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod config;
pub mod error;
pub mod filters;
pub mod logging;
pub mod similarity;
pub mod store;
pub mod traits;
pub mod types;

pub use config::RagConfig;
pub use error::{Error, Result};
pub use filters::Filters;
pub use traits::{Completer, DocumentStore, Embedder, VectorIndex};
pub use types::{
    AnswerStyle, BackendKind, Document, DocumentRef, IndexStats, IndexedDocument, Meta, RagAnswer, SearchHit,
};
