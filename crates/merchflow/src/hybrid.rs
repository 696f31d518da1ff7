// Copyright 2026 MerchFlow Contributors

//! Hybrid recommender
//!
//! Weighted fusion of the local content engine and the remote collaborative
//! engine. A content candidate contributes `score * content_weight`; a
//! collaborative candidate contributes `score * (1 - content_weight)`;
//! contributions sum when both engines propose the same product. Weights of
//! exactly 0 or 1 short-circuit the unused engine.
//!
//! Products the user has already seen (view / add-to-cart / purchase
//! events, plus any caller-supplied override list) are excluded; the
//! recommender over-requests to compensate and tops up from the fallback
//! ladder when filtering leaves it short:
//!
//! 1. Diverse-category sampler over the local catalog
//! 2. Popularity-by-market sampler
//! 3. First-N of the local catalog
//! 4. A fixed emergency placeholder list
//!
//! Engine failures are logged and degraded, never raised: the only way to
//! get an empty result is for every engine, the catalog and the popularity
//! source to be empty simultaneously, and even then the emergency list
//! answers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::collaborative::CollaborativeEngine;
use crate::content::ContentEngine;
use crate::events::EventStore;
use crate::product_cache::ProductCache;
use crate::types::{EventType, Product, Recommendation, ScoredId};

/// Extra candidates requested per excluded product, capped.
const MAX_OVER_REQUEST: usize = 10;

/// The fused recommender.
pub struct HybridRecommender {
    content: Arc<ContentEngine>,
    collaborative: Arc<dyn CollaborativeEngine>,
    event_store: Option<Arc<EventStore>>,
    product_cache: Option<Arc<ProductCache>>,
    content_weight: f64,
    exclude_seen: bool,
}

impl HybridRecommender {
    /// Create a recommender over the two engines.
    #[must_use]
    pub fn new(
        content: Arc<ContentEngine>,
        collaborative: Arc<dyn CollaborativeEngine>,
        content_weight: f64,
    ) -> Self {
        let content_weight = content_weight.clamp(0.0, 1.0);
        info!(content_weight, "hybrid recommender initialized");
        Self {
            content,
            collaborative,
            event_store: None,
            product_cache: None,
            content_weight,
            exclude_seen: true,
        }
    }

    /// Wire the event store used for the seen-set and event forwarding.
    #[must_use]
    pub fn with_event_store(mut self, event_store: Arc<EventStore>) -> Self {
        self.event_store = Some(event_store);
        self
    }

    /// Wire the product cache; enrichment is unconditional once present.
    #[must_use]
    pub fn with_product_cache(mut self, product_cache: Arc<ProductCache>) -> Self {
        self.product_cache = Some(product_cache);
        self
    }

    /// Toggle seen-product exclusion.
    #[must_use]
    pub fn with_exclude_seen(mut self, exclude_seen: bool) -> Self {
        self.exclude_seen = exclude_seen;
        self
    }

    /// Recommendations for a user, optionally anchored on a product.
    pub async fn recommend(
        &self,
        user_id: &str,
        product_id: Option<&str>,
        n: usize,
    ) -> Vec<Recommendation> {
        self.recommend_excluding(user_id, product_id, n, &[]).await
    }

    /// Recommendations excluding the user's seen-set plus an explicit
    /// override list (typically the conversation's shown products).
    pub async fn recommend_excluding(
        &self,
        user_id: &str,
        product_id: Option<&str>,
        n: usize,
        also_exclude: &[String],
    ) -> Vec<Recommendation> {
        let mut excluded: HashSet<String> = also_exclude.iter().cloned().collect();
        if self.exclude_seen {
            excluded.extend(self.seen_products(user_id).await);
        }
        debug!(user_id, excluded = excluded.len(), "assembling recommendations");

        let over_request = n + excluded.len().min(MAX_OVER_REQUEST);
        let fused = self.assemble(user_id, product_id, over_request).await;

        let mut recommendations: Vec<Recommendation> = fused
            .into_iter()
            .filter(|r| !excluded.contains(&r.id))
            .take(n)
            .collect();

        if recommendations.len() < n {
            let missing = n - recommendations.len();
            let mut ladder_exclude = excluded.clone();
            ladder_exclude.extend(recommendations.iter().map(|r| r.id.clone()));
            debug!(missing, "topping up from fallback ladder");
            recommendations.extend(self.fallback_ladder(missing, &ladder_exclude).await);
        }

        if self.product_cache.is_some() {
            self.enrich(&mut recommendations).await;
        }
        recommendations
    }

    /// Candidate assembly and fusion.
    async fn assemble(
        &self,
        user_id: &str,
        product_id: Option<&str>,
        n: usize,
    ) -> Vec<Recommendation> {
        let mut content_candidates: Vec<ScoredId> = Vec::new();
        if self.content_weight > 0.0 {
            if let Some(anchor) = product_id {
                content_candidates = self.content.similar_to(anchor, n);
                debug!(count = content_candidates.len(), "content candidates");
            }
        }

        let mut collaborative_candidates: Vec<ScoredId> = Vec::new();
        if self.content_weight < 1.0 {
            match self.collaborative.recommend(user_id, product_id, n).await {
                Ok(candidates) => {
                    debug!(count = candidates.len(), "collaborative candidates");
                    collaborative_candidates = candidates;
                }
                Err(err) => {
                    warn!(user_id, %err, "collaborative engine failed, degrading");
                }
            }
        }

        if content_candidates.is_empty() && collaborative_candidates.is_empty() {
            return Vec::new();
        }

        // Fuse: sum weighted contributions on ID collision.
        let mut combined: HashMap<String, (f64, &'static str)> = HashMap::new();
        for candidate in &content_candidates {
            combined.insert(
                candidate.id.clone(),
                (candidate.score * self.content_weight, "content"),
            );
        }
        for candidate in &collaborative_candidates {
            let contribution = candidate.score * (1.0 - self.content_weight);
            combined
                .entry(candidate.id.clone())
                .and_modify(|(score, source)| {
                    *score += contribution;
                    *source = "hybrid";
                })
                .or_insert((contribution, "collaborative"));
        }

        let mut fused: Vec<Recommendation> = combined
            .into_iter()
            .map(|(id, (score, source))| {
                Recommendation::from_candidate(&ScoredId::new(id, score), source)
            })
            .collect();
        fused.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        fused.truncate(n);
        fused
    }

    /// The user's seen-set: product IDs from view / add-to-cart / purchase
    /// events, via the event store when wired, else the collaborative
    /// engine's event feed.
    async fn seen_products(&self, user_id: &str) -> HashSet<String> {
        let events = if let Some(store) = &self.event_store {
            store.user_events(user_id).await.unwrap_or_default()
        } else {
            self.collaborative
                .user_events(user_id)
                .await
                .unwrap_or_default()
        };
        let seen: HashSet<String> = events
            .iter()
            .filter(|e| e.event_type.counts_as_seen())
            .filter_map(|e| e.product_id().map(str::to_string))
            .collect();
        if !seen.is_empty() {
            debug!(user_id, seen = seen.len(), "seen-product exclusion set built");
        }
        seen
    }

    // ========================================================================
    // Fallback ladder
    // ========================================================================

    async fn fallback_ladder(&self, n: usize, exclude: &HashSet<String>) -> Vec<Recommendation> {
        let mut out = self.diverse_category_sample(n, exclude);
        if out.len() < n {
            let mut exclude = exclude.clone();
            exclude.extend(out.iter().map(|r| r.id.clone()));
            out.extend(self.popularity_sample(n - out.len(), &exclude).await);
        }
        if out.len() < n {
            let mut exclude = exclude.clone();
            exclude.extend(out.iter().map(|r| r.id.clone()));
            out.extend(self.first_n_sample(n - out.len(), &exclude));
        }
        if out.len() < n {
            let mut exclude = exclude.clone();
            exclude.extend(out.iter().map(|r| r.id.clone()));
            out.extend(emergency_placeholders(n - out.len(), &exclude));
        }
        out.truncate(n);
        out
    }

    /// Rung 1: round-robin across catalog categories.
    fn diverse_category_sample(&self, n: usize, exclude: &HashSet<String>) -> Vec<Recommendation> {
        let products = self.content.products();
        if products.is_empty() {
            return Vec::new();
        }
        let mut by_category: Vec<(String, Vec<&Product>)> = Vec::new();
        for product in products {
            if exclude.contains(&product.id) {
                continue;
            }
            let category = product.category.to_lowercase();
            match by_category.iter_mut().find(|(c, _)| *c == category) {
                Some((_, list)) => list.push(product),
                None => by_category.push((category, vec![product])),
            }
        }

        let mut out = Vec::new();
        let mut round = 0;
        while out.len() < n {
            let mut any = false;
            for (_, list) in &by_category {
                if let Some(product) = list.get(round) {
                    any = true;
                    out.push(recommendation_from_product(product, 0.5, "fallback_diverse_category"));
                    if out.len() >= n {
                        break;
                    }
                }
            }
            if !any {
                break;
            }
            round += 1;
        }
        out
    }

    /// Rung 2: most popular products by observed market demand.
    async fn popularity_sample(&self, n: usize, exclude: &HashSet<String>) -> Vec<Recommendation> {
        let Some(cache) = &self.product_cache else {
            return Vec::new();
        };
        cache
            .popular_products("default", n + exclude.len())
            .await
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .take(n)
            .map(|id| {
                Recommendation::from_candidate(&ScoredId::new(id, 0.4), "fallback_popularity")
            })
            .collect()
    }

    /// Rung 3: first N of the catalog.
    fn first_n_sample(&self, n: usize, exclude: &HashSet<String>) -> Vec<Recommendation> {
        self.content
            .products()
            .iter()
            .filter(|p| !exclude.contains(&p.id))
            .take(n)
            .map(|p| recommendation_from_product(p, 0.3, "fallback_catalog"))
            .collect()
    }

    // ========================================================================
    // Enrichment
    // ========================================================================

    /// Fill each recommendation's display fields from the product cache.
    async fn enrich(&self, recommendations: &mut [Recommendation]) {
        let Some(cache) = &self.product_cache else {
            return;
        };
        let ids: Vec<String> = recommendations
            .iter()
            .filter(|r| !r.id.is_empty())
            .map(|r| r.id.clone())
            .collect();
        cache.preload(&ids, 5).await;

        for rec in recommendations.iter_mut() {
            if rec.id.is_empty() {
                continue;
            }
            match cache.get_product(&rec.id).await {
                Some(product) => {
                    rec.title = product.title;
                    rec.description = product.description;
                    rec.price = product.price;
                    rec.category = product.category;
                    rec.image_url = product.image_urls.first().cloned();
                }
                None => {
                    if rec.title.is_empty() {
                        rec.title = format!("Product {}", rec.id);
                    }
                    rec.incomplete_data = true;
                    debug!(product_id = %rec.id, "no record for enrichment");
                }
            }
        }
    }

    // ========================================================================
    // Event forwarding
    // ========================================================================

    /// Forward a user event to the collaborative engine for online
    /// learning and to the event store for the log. Returns the engine's
    /// acknowledgment tagged with the store outcome.
    pub async fn record_event(
        &self,
        user_id: &str,
        event_type: EventType,
        product_id: Option<&str>,
        amount: Option<f64>,
    ) -> Map<String, Value> {
        let mut ack = match self
            .collaborative
            .record_event(user_id, event_type, product_id, amount)
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                warn!(user_id, %err, "collaborative event forwarding failed");
                let mut ack = Map::new();
                ack.insert("status".into(), Value::String("error".into()));
                ack.insert("error".into(), Value::String(err.to_string()));
                ack
            }
        };

        let stored = if let Some(store) = &self.event_store {
            let mut data = Map::new();
            if let Some(pid) = product_id {
                data.insert("product_id".into(), Value::String(pid.to_string()));
            }
            if let Some(amount) = amount {
                data.insert("amount".into(), Value::from(amount));
            }
            store
                .record(user_id, event_type, data, Default::default())
                .await
        } else {
            false
        };
        ack.insert("event_store_recorded".into(), Value::Bool(stored));
        ack
    }
}

impl std::fmt::Debug for HybridRecommender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridRecommender")
            .field("content_weight", &self.content_weight)
            .field("exclude_seen", &self.exclude_seen)
            .field("enrichment", &self.product_cache.is_some())
            .finish()
    }
}

fn recommendation_from_product(product: &Product, score: f64, source: &str) -> Recommendation {
    Recommendation {
        id: product.id.clone(),
        title: product.title.clone(),
        description: product.description.clone(),
        price: product.price,
        category: product.category.clone(),
        image_url: product.image_urls.first().cloned(),
        score,
        source: source.to_string(),
        incomplete_data: false,
    }
}

/// Rung 4: the emergency placeholder list. Always non-empty so a total
/// outage still produces a response.
#[must_use]
pub fn emergency_placeholders(n: usize, exclude: &HashSet<String>) -> Vec<Recommendation> {
    let placeholders = [
        ("emergency-1", "Classic Blue Shirt", "High quality blue shirt with a classic cut.", 29.99),
        ("emergency-2", "Slim Fit Black Pants", "Black slim fit pants for formal occasions.", 39.99),
        ("emergency-3", "Brown Leather Shoes", "Classic brown leather shoes.", 59.99),
    ];
    placeholders
        .iter()
        .filter(|(id, ..)| !exclude.contains(*id))
        .take(n.max(1).min(placeholders.len()))
        .map(|(id, title, description, price)| Recommendation {
            id: (*id).to_string(),
            title: (*title).to_string(),
            description: (*description).to_string(),
            price: *price,
            category: "fashion".to_string(),
            image_url: None,
            score: 0.5,
            source: "emergency_fallback".to_string(),
            incomplete_data: false,
        })
        .collect()
}
