//! Chunk index and query execution
//!
//! One index entry per chunk, grouped into per-document partitions. Each
//! partition sits behind its own `RwLock`: re-indexing a document takes the
//! partition write lock, so queries scoped to that document serialize with
//! it and never observe a half-updated entry, while other documents are
//! untouched. The index owns its entries exclusively.

use crate::fusion::WeightedRrf;
use crate::lexical::{bm25_scores, LexicalCandidate};
use crate::semantic::{cosine, tokenize, TermVectorizer};
use finlens_common::config::RetrievalConfig;
use finlens_common::model::Chunk;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Optional filters applied before ranking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilters {
    /// Restrict to these documents
    pub document_ids: Option<Vec<Uuid>>,

    /// Exact fiscal-period match, e.g. "Q2 FY2025"
    pub fiscal_period: Option<String>,

    /// Case-insensitive substring match on the section label
    pub section_label: Option<String>,
}

impl QueryFilters {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_documents(document_ids: Vec<Uuid>) -> Self {
        Self {
            document_ids: Some(document_ids),
            ..Self::default()
        }
    }

    fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(ids) = &self.document_ids {
            if !ids.contains(&chunk.document_id) {
                return false;
            }
        }
        if let Some(period) = &self.fiscal_period {
            if &chunk.period.fiscal_period != period {
                return false;
            }
        }
        if let Some(label) = &self.section_label {
            if !chunk
                .section_label
                .to_lowercase()
                .contains(&label.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// A ranked retrieval result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,

    pub document_id: Uuid,

    pub section_label: String,

    pub content: String,

    /// Position within the source document; the stitcher re-sorts by this
    pub sequence: u32,

    /// Fused relevance score in [0, 1]
    pub score: f32,
}

/// Retriever-owned association between a chunk and its scoring
/// representation
struct IndexEntry {
    chunk: Chunk,
    terms: BTreeMap<String, u32>,
    token_count: u32,
    vector: Vec<f32>,
    /// Hex SHA-256 of the content; lets relevance caches key off content
    /// identity rather than chunk id
    cache_key: String,
}

#[derive(Default)]
struct DocPartition {
    entries: HashMap<Uuid, IndexEntry>,
}

/// Scoring snapshot taken under the partition read locks
struct Candidate {
    chunk_id: Uuid,
    document_id: Uuid,
    section_label: String,
    content: String,
    sequence: u32,
    terms: BTreeMap<String, u32>,
    token_count: u32,
    vector: Vec<f32>,
}

/// In-memory chunk index with per-document partitions
pub struct ChunkIndex {
    vectorizer: TermVectorizer,
    fusion: WeightedRrf,
    partitions: RwLock<HashMap<Uuid, Arc<RwLock<DocPartition>>>>,
}

impl ChunkIndex {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            vectorizer: TermVectorizer::new(config.vector_dim),
            fusion: WeightedRrf::new(
                config.rrf_k,
                config.lexical_weight,
                config.semantic_weight,
            ),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Upsert one index entry per chunk. Entries for an already-indexed
    /// chunk id are replaced atomically under the owning document's write
    /// lock.
    pub async fn index(&self, chunks: &[Chunk]) {
        // Group per document so each partition is locked exactly once
        let mut by_document: BTreeMap<Uuid, Vec<&Chunk>> = BTreeMap::new();
        for chunk in chunks {
            by_document.entry(chunk.document_id).or_default().push(chunk);
        }

        for (document_id, doc_chunks) in by_document {
            let partition = {
                let mut partitions = self.partitions.write().await;
                partitions
                    .entry(document_id)
                    .or_insert_with(|| Arc::new(RwLock::new(DocPartition::default())))
                    .clone()
            };

            let mut partition = partition.write().await;
            for chunk in &doc_chunks {
                partition
                    .entries
                    .insert(chunk.id, self.build_entry((*chunk).clone()));
            }

            debug!(
                document_id = %document_id,
                chunk_count = doc_chunks.len(),
                "Indexed document chunks"
            );
        }
    }

    /// Drop a document's partition when its source document is removed
    pub async fn remove_document(&self, document_id: Uuid) {
        let removed = self.partitions.write().await.remove(&document_id);
        if removed.is_some() {
            debug!(document_id = %document_id, "Removed document from index");
        }
    }

    /// Number of entries currently indexed
    pub async fn entry_count(&self) -> usize {
        let partitions: Vec<Arc<RwLock<DocPartition>>> =
            self.partitions.read().await.values().cloned().collect();

        let mut count = 0;
        for partition in partitions {
            count += partition.read().await.entries.len();
        }
        count
    }

    /// Content-identity cache key for an indexed chunk. Relevance caches
    /// key off this rather than the chunk id, so re-indexing unchanged
    /// content keeps cached scores valid.
    pub async fn cache_key(&self, chunk_id: Uuid) -> Option<String> {
        let partitions: Vec<Arc<RwLock<DocPartition>>> =
            self.partitions.read().await.values().cloned().collect();

        for partition in partitions {
            if let Some(entry) = partition.read().await.entries.get(&chunk_id) {
                return Some(entry.cache_key.clone());
            }
        }
        None
    }

    /// Rank indexed chunks against the query text.
    ///
    /// Lexical (BM25) and semantic (term-vector cosine) rankings are fused
    /// with weighted RRF; at most `k` results come back ordered by
    /// descending score, ties broken by ascending sequence number then
    /// chunk id, so repeated queries against an unchanged index return the
    /// same ids in the same order.
    pub async fn query(&self, text: &str, k: usize, filters: &QueryFilters) -> Vec<RetrievedChunk> {
        let query_terms = tokenize(text);
        if query_terms.is_empty() || k == 0 {
            return Vec::new();
        }
        let query_vector = self.vectorizer.vectorize(&query_terms);

        let candidates = self.collect_candidates(filters).await;
        if candidates.is_empty() {
            return Vec::new();
        }

        // Lexical ranking
        let lexical: Vec<f32> = {
            let inputs: Vec<LexicalCandidate<'_>> = candidates
                .iter()
                .map(|c| LexicalCandidate {
                    terms: &c.terms,
                    token_count: c.token_count,
                })
                .collect();
            bm25_scores(&query_terms, &inputs)
        };

        // Semantic ranking
        let semantic: Vec<f32> = candidates
            .iter()
            .map(|c| cosine(&query_vector, &c.vector))
            .collect();

        let lexical_ranking = ranked_ids(&candidates, &lexical);
        let semantic_ranking = ranked_ids(&candidates, &semantic);

        let fused = self.fusion.fuse(&lexical_ranking, &semantic_ranking);

        let mut results: Vec<RetrievedChunk> = candidates
            .into_iter()
            .filter_map(|c| {
                let score = *fused.get(&c.chunk_id)?;
                Some(RetrievedChunk {
                    chunk_id: c.chunk_id,
                    document_id: c.document_id,
                    section_label: c.section_label,
                    content: c.content,
                    sequence: c.sequence,
                    score,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.sequence.cmp(&b.sequence))
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(k);

        results
    }

    /// Snapshot matching entries under the partition read locks.
    /// Partitions are visited in document-id order for reproducibility.
    async fn collect_candidates(&self, filters: &QueryFilters) -> Vec<Candidate> {
        let partitions: BTreeMap<Uuid, Arc<RwLock<DocPartition>>> = {
            let map = self.partitions.read().await;
            map.iter()
                .filter(|(document_id, _)| match &filters.document_ids {
                    Some(ids) => ids.contains(document_id),
                    None => true,
                })
                .map(|(id, partition)| (*id, partition.clone()))
                .collect()
        };

        let mut candidates = Vec::new();
        for partition in partitions.values() {
            let partition = partition.read().await;

            let mut entries: Vec<&IndexEntry> = partition
                .entries
                .values()
                .filter(|entry| filters.matches(&entry.chunk))
                .collect();
            entries.sort_by_key(|entry| (entry.chunk.sequence, entry.chunk.id));

            for entry in entries {
                candidates.push(Candidate {
                    chunk_id: entry.chunk.id,
                    document_id: entry.chunk.document_id,
                    section_label: entry.chunk.section_label.clone(),
                    content: entry.chunk.content.clone(),
                    sequence: entry.chunk.sequence,
                    terms: entry.terms.clone(),
                    token_count: entry.token_count,
                    vector: entry.vector.clone(),
                });
            }
        }

        candidates
    }

    fn build_entry(&self, chunk: Chunk) -> IndexEntry {
        let terms = tokenize(&chunk.content);
        let token_count = terms.values().sum();
        let vector = self.vectorizer.vectorize(&terms);
        let cache_key = hex::encode(Sha256::digest(chunk.content.as_bytes()));

        IndexEntry {
            chunk,
            terms,
            token_count,
            vector,
            cache_key,
        }
    }
}

/// Order candidate ids by a score vector, best first, with the same
/// deterministic tie-break the final ranking uses. Zero-score candidates
/// do not participate in the ranking.
fn ranked_ids(candidates: &[Candidate], scores: &[f32]) -> Vec<Uuid> {
    let mut order: Vec<usize> = (0..candidates.len())
        .filter(|&i| scores[i] > 0.0)
        .collect();

    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(candidates[a].sequence.cmp(&candidates[b].sequence))
            .then(candidates[a].chunk_id.cmp(&candidates[b].chunk_id))
    });

    order.into_iter().map(|i| candidates[i].chunk_id).collect()
}
