//! Vector math and the input checks every backend shares.

use crate::error::{Error, Result};
use crate::types::IndexedDocument;

pub const MAX_TOP_K: usize = 1000;
const MAX_BASKET_ID_LEN: usize = 128;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity in [-1, 1]. Zero vectors have similarity 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    (dot(a, b) / denom).clamp(-1.0, 1.0)
}

/// Return a unit-length copy of `v`; zero vectors are returned unchanged.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n <= f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / n).collect()
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

/// Map a Euclidean distance into (0, 1].
pub fn distance_to_similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<()> {
    if embedding.len() != dimension {
        return Err(Error::validation(format!(
            "embedding dimension {} does not match index dimension {dimension}",
            embedding.len()
        )));
    }
    if let Some(pos) = embedding.iter().position(|x| !x.is_finite()) {
        return Err(Error::validation(format!("embedding contains a non-finite value at position {pos}")));
    }
    Ok(())
}

/// Validate a whole batch before anything is inserted.
pub fn validate_documents(documents: &[IndexedDocument], dimension: usize) -> Result<()> {
    for doc in documents {
        if doc.id.is_empty() {
            return Err(Error::validation("document id must not be empty"));
        }
        validate_embedding(&doc.embedding, dimension).map_err(|e| match e {
            Error::Validation(msg) => Error::Validation(format!("document '{}': {msg}", doc.id)),
            other => other,
        })?;
    }
    Ok(())
}

pub fn validate_top_k(top_k: usize) -> Result<()> {
    if top_k == 0 || top_k > MAX_TOP_K {
        return Err(Error::validation(format!("top_k must be in 1..={MAX_TOP_K}, got {top_k}")));
    }
    Ok(())
}

/// Basket ids are ASCII alphanumerics plus `-`, `_`, `.` and `:`.
pub fn validate_basket_id(basket_id: &str) -> Result<()> {
    let ok = !basket_id.is_empty()
        && basket_id.len() <= MAX_BASKET_ID_LEN
        && basket_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if ok { Ok(()) } else { Err(Error::validation(format!("malformed basket id '{basket_id}'"))) }
}
