// Copyright 2026 MerchFlow Contributors

//! Semantic intent extraction and exclusion hashing
//!
//! Cache keys must distinguish "show me headphones" from "show me more"
//! without over-normalizing either, so queries are reduced to a small set
//! of intent tags with a strict precedence:
//!
//! 1. Follow-up indicators, sub-classified by dimension (category, price,
//!    brand, general)
//! 2. Category keywords from the live or fallback vocabulary
//! 3. Recommendation verbs
//! 4. Information verbs (checked before search verbs)
//! 5. Search verbs
//! 6. Significant-word fallback
//!
//! Exclusion sets are reduced to a 12-hex-char MD5 over the sorted unique
//! product IDs so that the same set always hashes identically regardless of
//! order or duplication.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::Product;

/// Marker hash for an empty exclusion set.
pub const NO_EXCLUSIONS: &str = "no_exclusions";

const FOLLOW_UP_INDICATORS: &[&str] = &["more", "different", "other", "else", "another", "similar"];
const RECOMMEND_TOKENS: &[&str] = &["recommend", "show", "suggest"];
const INFORMATION_TOKENS: &[&str] = &["help", "assist", "info"];
const SEARCH_TOKENS: &[&str] = &["search", "find", "look"];

/// Category-to-keywords vocabulary used for initial-intent tagging.
///
/// The mapping is injectable: the factory derives one from the local
/// catalog when it is loaded and falls back to the built-in vocabulary
/// otherwise.
#[derive(Debug, Clone, Default)]
pub struct CategoryKeywords {
    map: BTreeMap<String, Vec<String>>,
}

impl CategoryKeywords {
    /// Empty vocabulary; every query falls through to the generic rules.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in fallback vocabulary.
    #[must_use]
    pub fn builtin() -> Self {
        let mut map = BTreeMap::new();
        let entries: [(&str, &[&str]); 5] = [
            (
                "electronics",
                &["phone", "laptop", "computer", "tablet", "headphone", "speaker", "electronic"],
            ),
            (
                "sports",
                &["fitness", "running", "yoga", "gym", "sport", "athletic", "exercise", "workout"],
            ),
            ("fashion", &["shirt", "pants", "dress", "jacket", "clothing", "apparel"]),
            ("home", &["furniture", "decor", "kitchen", "bedroom", "living"]),
            ("beauty", &["makeup", "skincare", "cosmetic", "beauty", "hair"]),
        ];
        for (category, keywords) in entries {
            map.insert(
                category.to_string(),
                keywords.iter().map(|k| (*k).to_string()).collect(),
            );
        }
        Self { map }
    }

    /// Derive a vocabulary from a product catalog: each category maps to its
    /// own name plus the significant words (length > 3) of its titles.
    #[must_use]
    pub fn from_catalog(products: &[Product]) -> Self {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for product in products {
            let category = product.category.trim().to_lowercase();
            if category.is_empty() {
                continue;
            }
            let keywords = map.entry(category.clone()).or_default();
            push_unique(keywords, category);
            for word in product.title.to_lowercase().split_whitespace() {
                let clean: String = word
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_string();
                if clean.len() > 3 {
                    push_unique(keywords, clean);
                }
            }
        }
        Self { map }
    }

    /// Explicit vocabulary, e.g. loaded from configuration.
    #[must_use]
    pub fn from_map(map: BTreeMap<String, Vec<String>>) -> Self {
        Self { map }
    }

    /// Whether the vocabulary has any categories.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate categories and their keywords in stable order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.map.iter()
    }
}

fn push_unique(keywords: &mut Vec<String>, word: String) {
    if !keywords.contains(&word) {
        keywords.push(word);
    }
}

/// Reduce a free-text query to its semantic intent tag.
#[must_use]
pub fn extract_semantic_intent(query: &str, categories: &CategoryKeywords) -> String {
    let query = query.to_lowercase();
    let query = query.trim();

    // Follow-ups are checked first: "show me more" must never collide with
    // the initial "show me headphones".
    if FOLLOW_UP_INDICATORS.iter().any(|w| query.contains(w)) {
        if query.contains("category") || query.contains("type") {
            return "follow_up_category".to_string();
        }
        if query.contains("price") || query.contains("cheaper") || query.contains("expensive") {
            return "follow_up_price".to_string();
        }
        if query.contains("brand") {
            return "follow_up_brand".to_string();
        }
        return "follow_up_general".to_string();
    }

    let builtin;
    let vocabulary = if categories.is_empty() {
        builtin = CategoryKeywords::builtin();
        &builtin
    } else {
        categories
    };
    for (category, keywords) in vocabulary.iter() {
        if keywords.iter().any(|k| !k.is_empty() && query.contains(k.as_str())) {
            return format!("initial_{category}");
        }
    }

    if RECOMMEND_TOKENS.iter().any(|w| query.contains(w)) {
        return "initial_general_recommendation".to_string();
    }

    // Explicit help/assist requests win over generic search verbs.
    if INFORMATION_TOKENS.iter().any(|w| query.contains(w)) {
        return "information_request".to_string();
    }

    if SEARCH_TOKENS.iter().any(|w| query.contains(w)) {
        return "search_query".to_string();
    }

    // Fallback: up to the first 4 significant words.
    let words: Vec<&str> = query
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .take(4)
        .collect();
    if words.is_empty() {
        "general_query".to_string()
    } else {
        words.join("_")
    }
}

/// Hash an exclusion set into a compact, order-insensitive identifier.
///
/// Sorted unique IDs are joined with commas and reduced to the first 12 hex
/// characters of their MD5 digest. An empty set maps to [`NO_EXCLUSIONS`].
#[must_use]
pub fn hash_product_list(product_ids: &[String]) -> String {
    if product_ids.is_empty() {
        return NO_EXCLUSIONS.to_string();
    }
    let mut sorted: Vec<&str> = product_ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let joined = sorted.join(",");
    let digest = md5::compute(joined.as_bytes());
    format!("{digest:x}")[..12].to_string()
}

/// The composite cache-key components, serialized in stable field order.
#[derive(Debug, Serialize)]
struct KeyComponents<'a> {
    excluded: &'a str,
    intent: &'a str,
    market: &'a str,
    turn: u32,
    user: &'a str,
}

/// Derive the 16-hex-char composite hash over the key components.
#[must_use]
pub fn composite_key_hash(
    user_id: &str,
    intent: &str,
    turn: u32,
    excluded_hash: &str,
    market_id: &str,
) -> String {
    let components = KeyComponents {
        excluded: excluded_hash,
        intent,
        market: market_id,
        turn,
        user: user_id,
    };
    // Serialization of a fixed-order struct is stable across calls.
    let json = serde_json::to_string(&components).unwrap_or_default();
    let digest = md5::compute(json.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> CategoryKeywords {
        CategoryKeywords::builtin()
    }

    #[test]
    fn follow_up_subclassification() {
        let cats = builtin();
        assert_eq!(extract_semantic_intent("show me more", &cats), "follow_up_general");
        assert_eq!(
            extract_semantic_intent("something in a different category", &cats),
            "follow_up_category"
        );
        assert_eq!(
            extract_semantic_intent("other options but cheaper", &cats),
            "follow_up_price"
        );
        assert_eq!(
            extract_semantic_intent("another brand please", &cats),
            "follow_up_brand"
        );
    }

    #[test]
    fn category_keywords_tag_initial_intents() {
        let cats = builtin();
        assert_eq!(
            extract_semantic_intent("show me headphones", &cats),
            "initial_electronics"
        );
        assert_eq!(
            extract_semantic_intent("I want a yoga mat", &cats),
            "initial_sports"
        );
    }

    #[test]
    fn recommendation_verbs_without_category() {
        let cats = builtin();
        assert_eq!(
            extract_semantic_intent("recommend me something nice", &cats),
            "initial_general_recommendation"
        );
    }

    #[test]
    fn information_beats_search() {
        let cats = builtin();
        // "help" and "find" both present: information wins.
        assert_eq!(
            extract_semantic_intent("help me find a gift", &cats),
            "information_request"
        );
        assert_eq!(extract_semantic_intent("find me a gift", &cats), "search_query");
    }

    #[test]
    fn significant_word_fallback() {
        let cats = builtin();
        assert_eq!(
            extract_semantic_intent("durable waterproof hiking boots maybe", &cats),
            "durable_waterproof_hiking_boots"
        );
        assert_eq!(extract_semantic_intent("ok go", &cats), "general_query");
        assert_eq!(extract_semantic_intent("", &cats), "general_query");
    }

    #[test]
    fn exclusion_hash_is_order_and_dup_insensitive() {
        let a = hash_product_list(&["p2".into(), "p1".into(), "p3".into()]);
        let b = hash_product_list(&["p1".into(), "p3".into(), "p2".into(), "p2".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(a, NO_EXCLUSIONS);
    }

    #[test]
    fn empty_exclusions_use_marker() {
        assert_eq!(hash_product_list(&[]), NO_EXCLUSIONS);
    }

    #[test]
    fn different_sets_hash_differently() {
        let a = hash_product_list(&["p1".into(), "p2".into()]);
        let b = hash_product_list(&["p1".into(), "p9".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn composite_hash_is_stable_and_sensitive() {
        let a = composite_key_hash("u1", "initial_electronics", 1, NO_EXCLUSIONS, "US");
        let b = composite_key_hash("u1", "initial_electronics", 1, NO_EXCLUSIONS, "US");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let different_turn = composite_key_hash("u1", "initial_electronics", 2, NO_EXCLUSIONS, "US");
        assert_ne!(a, different_turn);
        let different_excluded = composite_key_hash("u1", "initial_electronics", 1, "abc123def456", "US");
        assert_ne!(a, different_excluded);
    }

    #[test]
    fn catalog_vocabulary_derives_categories_and_title_words() {
        let products = vec![
            Product {
                id: "1".into(),
                title: "Wireless Noise Cancelling Headphones".into(),
                description: String::new(),
                price: 100.0,
                currency: "USD".into(),
                category: "Audio".into(),
                image_urls: vec![],
                metadata: BTreeMap::new(),
                is_minimal: false,
            },
            Product {
                id: "2".into(),
                title: "Compact Speaker".into(),
                description: String::new(),
                price: 50.0,
                currency: "USD".into(),
                category: "Audio".into(),
                image_urls: vec![],
                metadata: BTreeMap::new(),
                is_minimal: false,
            },
        ];
        let cats = CategoryKeywords::from_catalog(&products);
        assert!(!cats.is_empty());
        assert_eq!(
            extract_semantic_intent("wireless headphones please", &cats),
            "initial_audio"
        );
    }
}
