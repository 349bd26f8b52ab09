//! BM25 lexical scoring
//!
//! Scores candidates against the query with Okapi BM25. Document
//! frequencies are computed over the filtered candidate set at query time,
//! which keeps scoring consistent with whatever filters were applied.

use std::collections::BTreeMap;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// A scoring candidate: term frequencies plus total token count
pub struct LexicalCandidate<'a> {
    pub terms: &'a BTreeMap<String, u32>,
    pub token_count: u32,
}

/// Compute BM25 scores for each candidate against the query terms.
/// Returns one score per candidate, in input order.
pub fn bm25_scores(query_terms: &BTreeMap<String, u32>, candidates: &[LexicalCandidate<'_>]) -> Vec<f32> {
    let n = candidates.len();
    if n == 0 || query_terms.is_empty() {
        return vec![0.0; n];
    }

    let avg_len = candidates.iter().map(|c| c.token_count as f32).sum::<f32>() / n as f32;
    let avg_len = avg_len.max(1.0);

    // Document frequency per query term over the candidate set
    let mut df: BTreeMap<&str, u32> = BTreeMap::new();
    for term in query_terms.keys() {
        let count = candidates
            .iter()
            .filter(|c| c.terms.contains_key(term.as_str()))
            .count() as u32;
        df.insert(term.as_str(), count);
    }

    candidates
        .iter()
        .map(|candidate| {
            let mut score = 0.0f32;

            for term in query_terms.keys() {
                let tf = match candidate.terms.get(term.as_str()) {
                    Some(tf) => *tf as f32,
                    None => continue,
                };

                let term_df = df[term.as_str()] as f32;
                let idf = (1.0 + (n as f32 - term_df + 0.5) / (term_df + 0.5)).ln();

                let len_norm = 1.0 - B + B * candidate.token_count as f32 / avg_len;
                score += idf * tf * (K1 + 1.0) / (tf + K1 * len_norm);
            }

            score
        })
        .collect()
}
