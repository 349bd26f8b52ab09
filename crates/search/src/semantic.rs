//! Semantic similarity over hashed term vectors
//!
//! Chunks and queries are embedded into fixed-dimension vectors by hashing
//! each token to a dimension with SHA-256 and accumulating term frequency.
//! The hash is stable across processes, so the same text always produces
//! the same vector and retrieval stays reproducible.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hashed bag-of-terms vectorizer
#[derive(Debug, Clone)]
pub struct TermVectorizer {
    dim: usize,
}

impl TermVectorizer {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Map a term to its dimension via the first four bytes of its SHA-256
    fn slot(&self, term: &str) -> usize {
        let digest = Sha256::digest(term.as_bytes());
        let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        raw as usize % self.dim
    }

    /// Build an L2-normalized vector from term frequencies
    pub fn vectorize(&self, terms: &BTreeMap<String, u32>) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];

        for (term, tf) in terms {
            vector[self.slot(term)] += *tf as f32;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

/// Cosine similarity of two same-length vectors. Inputs are normalized at
/// build time, so this is a plain dot product.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Tokenize text for both lexical and semantic scoring: lowercase,
/// alphanumeric only, tokens of at least two characters.
pub fn tokenize(text: &str) -> BTreeMap<String, u32> {
    let mut terms = BTreeMap::new();

    for word in text.split_whitespace() {
        let token: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        if token.len() >= 2 {
            *terms.entry(token).or_insert(0) += 1;
        }
    }

    terms
}
