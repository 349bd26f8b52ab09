//! FinLens Search
//!
//! Retrieval over chunked financial documents:
//! - Lexical scoring (BM25 over tokenized chunk text)
//! - Semantic scoring (cosine over stable-hashed term vectors)
//! - Weighted reciprocal-rank fusion of the two rankings
//!
//! The index is partitioned per document: indexing a document serializes
//! with queries scoped to it, while unrelated documents proceed
//! independently.

pub mod fusion;
pub mod index;
pub mod lexical;
pub mod semantic;

pub use fusion::WeightedRrf;
pub use index::{ChunkIndex, QueryFilters, RetrievedChunk};
pub use semantic::TermVectorizer;
