//! Hybrid retrieval scoring: BM25 + cosine similarity (SPEC_FULL.md §4.9).
//!
//! Grounded in the indexed-document vocabulary of the runtime's original
//! RAG module (`rag/types.rs`); the scoring math itself is new, since the
//! teacher never combined BM25 with a dense index.

use std::collections::HashMap;

use crate::types::Embedding;

/// One document's worth of candidate text, pre-tokenised length included so
/// BM25 doesn't need to re-tokenise on every query.
pub struct Candidate<'a> {
    pub content: &'a str,
    pub doc_len: u32,
    pub embedding: Option<&'a Embedding>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

/// BM25 score of `query` against every candidate, given the corpus average
/// document length. Returns one score per candidate, same order as input.
pub fn bm25_scores(query: &str, candidates: &[Candidate], k1: f32, b: f32) -> Vec<f32> {
    let query_terms = tokenize(query);
    if candidates.is_empty() || query_terms.is_empty() {
        return vec![0.0; candidates.len()];
    }

    let n = candidates.len() as f32;
    let avg_len = candidates.iter().map(|c| c.doc_len as f32).sum::<f32>() / n;

    // Document frequency per query term.
    let mut df: HashMap<&str, usize> = HashMap::new();
    let tokenized_docs: Vec<Vec<String>> = candidates.iter().map(|c| tokenize(c.content)).collect();
    for term in &query_terms {
        let count = tokenized_docs
            .iter()
            .filter(|doc| doc.contains(term))
            .count();
        df.insert(term.as_str(), count);
    }

    tokenized_docs
        .iter()
        .zip(candidates.iter())
        .map(|(doc_terms, candidate)| {
            let doc_len = candidate.doc_len.max(1) as f32;
            let mut score = 0.0f32;
            for term in &query_terms {
                let term_freq = doc_terms.iter().filter(|t| *t == term).count() as f32;
                if term_freq == 0.0 {
                    continue;
                }
                let n_q = *df.get(term.as_str()).unwrap_or(&0) as f32;
                let idf = ((n - n_q + 0.5) / (n_q + 0.5) + 1.0).ln();
                let numerator = term_freq * (k1 + 1.0);
                let denominator = term_freq + k1 * (1.0 - b + b * (doc_len / avg_len));
                score += idf * (numerator / denominator);
            }
            score
        })
        .collect()
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 if either
/// vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Vector similarity of `query_embedding` against every candidate that has
/// an embedding; candidates without one score 0.0 (not skipped — the caller
/// keeps the column aligned so it can be combined positionally).
pub fn vector_scores(query_embedding: &Embedding, candidates: &[Candidate]) -> Vec<f32> {
    candidates
        .iter()
        .map(|c| match c.embedding {
            Some(e) => cosine_similarity(query_embedding, e),
            None => 0.0,
        })
        .collect()
}

/// Independent min-max normalisation of a score column to [0, 1]. A
/// constant column (including all-zero) normalises to all zeros.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Combine two normalised score columns into a weighted final score.
pub fn combine(bm25_norm: &[f32], vector_norm: &[f32], w_bm25: f32, w_vector: f32) -> Vec<f32> {
    bm25_norm
        .iter()
        .zip(vector_norm.iter())
        .map(|(b, v)| w_bm25 * b + w_vector * v)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bm25_prefers_more_term_matches() {
        let candidates = vec![
            Candidate {
                content: "rust memory safety ownership",
                doc_len: 4,
                embedding: None,
            },
            Candidate {
                content: "a completely unrelated document about gardening",
                doc_len: 6,
                embedding: None,
            },
        ];
        let scores = bm25_scores("rust ownership", &candidates, 1.2, 0.75);
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn min_max_normalize_constant_column_is_zero() {
        let scores = vec![5.0, 5.0, 5.0];
        assert_eq!(min_max_normalize(&scores), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn combine_respects_weights() {
        let bm25 = vec![1.0, 0.0];
        let vector = vec![0.0, 1.0];
        let combined = combine(&bm25, &vector, 1.0, 0.0);
        assert_eq!(combined, vec![1.0, 0.0]);
    }

    #[test]
    fn pure_bm25_weighting_ranks_text_match_first() {
        let embedding_a = vec![1.0, 0.0];
        let embedding_b = vec![0.0, 1.0];
        let candidates = vec![
            Candidate {
                content: "no overlap with the query at all",
                doc_len: 7,
                embedding: Some(&embedding_a),
            },
            Candidate {
                content: "exact query term hit",
                doc_len: 4,
                embedding: Some(&embedding_b),
            },
        ];
        let query_embedding = vec![0.0, 1.0];
        let bm25 = min_max_normalize(&bm25_scores("query term", &candidates, 1.2, 0.75));
        let vector = min_max_normalize(&vector_scores(&query_embedding, &candidates));
        let combined = combine(&bm25, &vector, 1.0, 0.0);
        assert!(combined[1] >= combined[0]);
    }
}
