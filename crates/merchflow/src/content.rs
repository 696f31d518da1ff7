// Copyright 2026 MerchFlow Contributors

//! Local content-similarity engine
//!
//! Holds the local product catalog and answers similarity and text-search
//! queries over it. Each product's title, description and category are
//! tokenized into a TF-IDF weighted term vector; similarity is cosine
//! distance between vectors. The engine is a leaf service: both the hybrid
//! recommender and the product cache receive a handle to the same instance
//! from the factory, and the engine never reaches back into either.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::intent::CategoryKeywords;
use crate::types::{Product, ScoredId};

/// The local similarity-over-catalog recommender.
#[derive(Debug)]
pub struct ContentEngine {
    products: Vec<Product>,
    index: HashMap<String, usize>,
    vectors: Vec<HashMap<String, f64>>,
}

impl ContentEngine {
    /// Build the engine over a product catalog.
    #[must_use]
    pub fn new(products: Vec<Product>) -> Self {
        let documents: Vec<Vec<String>> = products.iter().map(product_tokens).collect();

        // Document frequency per term.
        let mut df: HashMap<String, usize> = HashMap::new();
        for tokens in &documents {
            let mut seen: Vec<&String> = tokens.iter().collect();
            seen.sort_unstable();
            seen.dedup();
            for term in seen {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
        }

        let n_docs = documents.len().max(1) as f64;
        let idf: HashMap<String, f64> = df
            .into_iter()
            .map(|(term, count)| (term, (n_docs / (1.0 + count as f64)).ln() + 1.0))
            .collect();

        let vectors: Vec<HashMap<String, f64>> = documents
            .iter()
            .map(|tokens| {
                let mut tf: HashMap<String, f64> = HashMap::new();
                for token in tokens {
                    *tf.entry(token.clone()).or_insert(0.0) += 1.0;
                }
                let len = tokens.len().max(1) as f64;
                tf.into_iter()
                    .map(|(term, count)| {
                        let weight = count / len * idf.get(&term).copied().unwrap_or(1.0);
                        (term, weight)
                    })
                    .collect()
            })
            .collect();

        let index = products
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();

        info!(products = products.len(), "content engine loaded");
        Self {
            products,
            index,
            vectors,
        }
    }

    /// An engine with no catalog. Similarity and search return nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Whether a catalog is loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        !self.products.is_empty()
    }

    /// The full catalog, in load order.
    #[must_use]
    pub fn products(&self) -> &[Product] {
        &self.products
    }

    /// Look up a product by ID.
    #[must_use]
    pub fn get_product(&self, product_id: &str) -> Option<&Product> {
        self.index.get(product_id).map(|&i| &self.products[i])
    }

    /// Intent vocabulary derived from the loaded catalog.
    #[must_use]
    pub fn category_keywords(&self) -> CategoryKeywords {
        CategoryKeywords::from_catalog(&self.products)
    }

    /// Products most similar to the given one, best first. The anchor
    /// product itself is never returned.
    #[must_use]
    pub fn similar_to(&self, product_id: &str, n: usize) -> Vec<ScoredId> {
        let Some(&anchor_idx) = self.index.get(product_id) else {
            debug!(product_id, "similarity anchor not in catalog");
            return Vec::new();
        };
        let anchor = &self.vectors[anchor_idx];

        let mut scored: Vec<ScoredId> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != anchor_idx)
            .map(|(i, vector)| ScoredId::new(self.products[i].id.clone(), cosine(anchor, vector)))
            .filter(|s| s.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(n);
        scored
    }

    /// Products matching a free-text query, best first. Scores are the sum
    /// of matched-term weights normalized by the query length.
    #[must_use]
    pub fn search_products(&self, query: &str, n: usize) -> Vec<ScoredId> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<ScoredId> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, vector)| {
                let matched: f64 = query_tokens
                    .iter()
                    .filter_map(|t| vector.get(t))
                    .sum();
                ScoredId::new(self.products[i].id.clone(), matched / query_tokens.len() as f64)
            })
            .filter(|s| s.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(n);
        scored
    }

}

fn product_tokens(product: &Product) -> Vec<String> {
    let mut tokens = tokenize(&product.title);
    tokens.extend(tokenize(&product.description));
    tokens.extend(tokenize(&product.category));
    tokens
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect()
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, weight)| b.get(term).map(|other| weight * other))
        .sum();
    if dot == 0.0 {
        return 0.0;
    }
    let norm_a: f64 = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
