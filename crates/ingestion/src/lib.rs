//! FinLens Ingestion
//!
//! Turns structured financial documents into the ordered chunk sequences
//! the retriever indexes. Raw file parsing happens upstream; this crate
//! only sees already-structured documents.

pub mod chunker;

pub use chunker::Chunker;
