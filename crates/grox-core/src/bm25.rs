//! Okapi BM25 scoring over a small in-memory corpus.
//!
//! Used to lexically re-rank a vector-prefiltered candidate pool; the
//! corpus is never the whole collection.
//!
//! ```text
//! idf(t)      = ln((N - n(t) + 0.5) / (n(t) + 0.5))
//! idf(t) < 0  → epsilon × mean(idf), or epsilon when that mean is not positive
//! score(d, q) = Σ idf(t) · tf(t,d)·(k1+1) / (tf(t,d) + k1·(1 - b + b·|d|/avgdl))
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Document-length normalization.
    pub b: f64,
    /// Floor factor for the idf of terms present in most documents.
    pub epsilon: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            epsilon: 0.25,
        }
    }
}

/// Lowercase and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Inverted statistics for one corpus.
#[derive(Debug)]
pub struct Bm25Index {
    params: Bm25Params,
    doc_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Index {
    pub fn new<S: AsRef<str>>(corpus: &[S], params: Bm25Params) -> Self {
        let mut doc_freqs = Vec::with_capacity(corpus.len());
        let mut doc_lens = Vec::with_capacity(corpus.len());
        let mut df: HashMap<String, usize> = HashMap::new();

        for doc in corpus {
            let tokens = tokenize(doc.as_ref());
            doc_lens.push(tokens.len());
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for t in tokens {
                *freqs.entry(t).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
            doc_freqs.push(freqs);
        }

        let n = corpus.len() as f64;
        let total_len: usize = doc_lens.iter().sum();
        let avgdl = if corpus.is_empty() {
            0.0
        } else {
            total_len as f64 / n
        };

        let mut idf: HashMap<String, f64> = df
            .iter()
            .map(|(term, &freq)| {
                let freq = freq as f64;
                (term.clone(), ((n - freq + 0.5) / (freq + 0.5)).ln())
            })
            .collect();

        if !idf.is_empty() {
            let mean = idf.values().sum::<f64>() / idf.len() as f64;
            let floor = if mean > 0.0 {
                params.epsilon * mean
            } else {
                params.epsilon
            };
            for value in idf.values_mut() {
                if *value < 0.0 {
                    *value = floor;
                }
            }
        }

        Self {
            params,
            doc_freqs,
            doc_lens,
            avgdl,
            idf,
        }
    }

    /// Score every corpus document against `query`, in corpus order.
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let terms = tokenize(query);
        let Bm25Params { k1, b, .. } = self.params;

        self.doc_freqs
            .iter()
            .zip(&self.doc_lens)
            .map(|(freqs, &len)| {
                let norm = if self.avgdl > 0.0 {
                    1.0 - b + b * len as f64 / self.avgdl
                } else {
                    1.0
                };
                terms
                    .iter()
                    .map(|t| {
                        let tf = freqs.get(t).copied().unwrap_or(0) as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let idf = self.idf.get(t).copied().unwrap_or(0.0);
                        idf * tf * (k1 + 1.0) / (tf + k1 * norm)
                    })
                    .sum()
            })
            .collect()
    }

    /// Indices of the `k` best-scoring documents; ties keep corpus order.
    pub fn top_n(&self, query: &str, k: usize) -> Vec<usize> {
        let scores = self.scores(query);
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(k);
        order
    }
}
