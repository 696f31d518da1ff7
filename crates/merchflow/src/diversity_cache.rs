// Copyright 2026 MerchFlow Contributors

//! Diversity-aware personalization cache
//!
//! Caches recommendation responses without ever breaking the
//! diversification contract the recommender just upheld. The cache key is
//! derived from five dimensions:
//!
//! - **user** - personalization boundary
//! - **intent** - the semantic intent tag of the query, not the raw text
//! - **turn** - initial vs. follow-up rounds never share entries
//! - **excluded** - hash of the specific product IDs already shown
//! - **market** - localization boundary
//!
//! Two requests that differ only in their shown-product sets therefore
//! derive different keys, so a follow-up can never be served the products
//! it asked to move past.
//!
//! TTLs follow conversation velocity: initial turns are stable (300s),
//! active conversations move fast (60s), highly engaged users faster
//! still (30s).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::intent::{self, CategoryKeywords};
use crate::kv::KvStore;
use crate::types::{RecommendationResponse, RequestContext};

/// Key prefix for diversity cache entries. The version tag guards against
/// older envelope layouts still present in a shared store.
pub const CACHE_PREFIX: &str = "diversity_cache_v2";

/// Cache performance metrics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Lookups served.
    pub total_requests: u64,
    /// Lookups answered from cache.
    pub cache_hits: u64,
    /// Lookups that missed.
    pub cache_misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate_percentage: f64,
    /// Running average latency of hits in milliseconds.
    pub avg_response_time_hit_ms: f64,
    /// Running average latency of misses in milliseconds.
    pub avg_response_time_miss_ms: f64,
    /// Lookups whose non-empty exclusion set forced a distinct key.
    pub diversification_preserved: u64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    avg_hit_ms: f64,
    avg_miss_ms: f64,
    diversification_preserved: u64,
}

impl MetricsInner {
    fn record_hit(&mut self, elapsed_ms: f64) {
        self.cache_hits += 1;
        let n = self.cache_hits as f64;
        self.avg_hit_ms = (self.avg_hit_ms * (n - 1.0) + elapsed_ms) / n;
    }

    fn record_miss(&mut self, elapsed_ms: f64) {
        self.cache_misses += 1;
        let n = self.cache_misses as f64;
        self.avg_miss_ms = (self.avg_miss_ms * (n - 1.0) + elapsed_ms) / n;
    }

    fn snapshot(&self) -> CacheMetrics {
        let hit_rate = if self.total_requests > 0 {
            self.cache_hits as f64 / self.total_requests as f64 * 100.0
        } else {
            0.0
        };
        CacheMetrics {
            total_requests: self.total_requests,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            hit_rate_percentage: hit_rate,
            avg_response_time_hit_ms: self.avg_hit_ms,
            avg_response_time_miss_ms: self.avg_miss_ms,
            diversification_preserved: self.diversification_preserved,
        }
    }
}

/// Envelope stored under a diversity cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    /// User the entry belongs to.
    pub user_id: String,
    /// Original query text.
    pub query: String,
    /// The cached response.
    pub response: RecommendationResponse,
    /// Snapshot of the context at caching time.
    pub context_snapshot: ContextSnapshot,
    /// Unix timestamp when cached.
    pub cached_at: i64,
    /// Unix timestamp when the entry expires.
    pub expires_at: i64,
    /// TTL applied, in seconds.
    pub ttl: u64,
}

/// Reduced context recorded alongside a cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Conversational turn at caching time.
    pub turn_number: u32,
    /// Market at caching time.
    pub market_id: String,
    /// How many products had been shown at caching time.
    pub shown_products_count: usize,
}

/// The diversity-aware response cache.
pub struct DiversityAwareCache {
    kv: Arc<dyn KvStore>,
    categories: CategoryKeywords,
    metrics_enabled: bool,
    metrics: Mutex<MetricsInner>,
}

impl DiversityAwareCache {
    /// Create a cache over the given store with the given intent
    /// vocabulary.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, categories: CategoryKeywords) -> Self {
        info!("diversity-aware cache initialized");
        Self {
            kv,
            categories,
            metrics_enabled: true,
            metrics: Mutex::new(MetricsInner::default()),
        }
    }

    /// Disable metric recording (hit/miss counters still advance).
    #[must_use]
    pub fn without_metrics(mut self) -> Self {
        self.metrics_enabled = false;
        self
    }

    /// Derive the full cache key for a request.
    #[must_use]
    pub fn cache_key(&self, user_id: &str, query: &str, context: &RequestContext) -> String {
        let semantic_intent = intent::extract_semantic_intent(query, &self.categories);
        let excluded_hash = intent::hash_product_list(&context.shown_products);
        let key_hash = intent::composite_key_hash(
            user_id,
            &semantic_intent,
            context.turn_number,
            &excluded_hash,
            &context.market_id,
        );
        let key = format!("{CACHE_PREFIX}:{user_id}:{key_hash}");
        debug!(
            %key,
            intent = %semantic_intent,
            turn = context.turn_number,
            excluded = context.shown_products.len(),
            "cache key derived"
        );
        key
    }

    /// TTL for an entry based on conversation velocity.
    #[must_use]
    pub fn dynamic_ttl(context: &RequestContext) -> Duration {
        if context.turn_number == 1 {
            // First interaction: stable, high reuse probability.
            Duration::from_secs(300)
        } else if context.engagement_score.unwrap_or(0.5) > 0.8 {
            // Highly engaged users shift preference quickly.
            Duration::from_secs(30)
        } else {
            Duration::from_secs(60)
        }
    }

    /// Look up a cached response for this request.
    ///
    /// On a hit the response is tagged with `_cache_hit`, `_cache_key` and
    /// `_response_time_ms` metadata. Hit/miss metrics advance exactly once
    /// per call.
    pub async fn get_cached(
        &self,
        user_id: &str,
        query: &str,
        context: &RequestContext,
    ) -> Option<RecommendationResponse> {
        let start = Instant::now();
        {
            let mut metrics = self.metrics.lock();
            metrics.total_requests += 1;
            if !context.shown_products.is_empty() {
                metrics.diversification_preserved += 1;
            }
        }

        let key = self.cache_key(user_id, query, context);
        let raw = match self.kv.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "cache lookup failed");
                self.record_miss(start);
                return None;
            }
        };

        let Some(raw) = raw else {
            debug!(%key, "cache MISS");
            self.record_miss(start);
            return None;
        };

        match serde_json::from_str::<CacheEnvelope>(&raw) {
            Ok(envelope) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                if self.metrics_enabled {
                    self.metrics.lock().record_hit(elapsed_ms);
                } else {
                    self.metrics.lock().cache_hits += 1;
                }
                info!(%key, elapsed_ms, "cache HIT");
                let mut response = envelope.response;
                response.set_meta("_cache_hit", true);
                response.set_meta("_cache_key", key);
                response.set_meta("_response_time_ms", elapsed_ms);
                Some(response)
            }
            Err(err) => {
                warn!(%key, %err, "corrupt cache entry, treating as miss");
                self.record_miss(start);
                None
            }
        }
    }

    /// Store a response, wrapping it in an envelope and applying the
    /// dynamic TTL unless an explicit one is given.
    pub async fn cache(
        &self,
        user_id: &str,
        query: &str,
        context: &RequestContext,
        response: &RecommendationResponse,
        ttl: Option<Duration>,
    ) -> bool {
        let key = self.cache_key(user_id, query, context);
        let ttl = ttl.unwrap_or_else(|| Self::dynamic_ttl(context));
        let now = Utc::now().timestamp();
        let envelope = CacheEnvelope {
            user_id: user_id.to_string(),
            query: query.to_string(),
            response: response.clone(),
            context_snapshot: ContextSnapshot {
                turn_number: context.turn_number,
                market_id: context.market_id.clone(),
                shown_products_count: context.shown_products.len(),
            },
            cached_at: now,
            expires_at: now + ttl.as_secs() as i64,
            ttl: ttl.as_secs(),
        };

        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "failed to serialize cache envelope");
                return false;
            }
        };

        match self.kv.set(&key, &raw, Some(ttl)).await {
            Ok(true) => {
                info!(%key, ttl_s = ttl.as_secs(), "response cached");
                true
            }
            Ok(false) => {
                warn!(%key, "store declined cache write");
                false
            }
            Err(err) => {
                warn!(%key, %err, "cache write failed");
                false
            }
        }
    }

    /// Drop every cached entry for a user. Returns how many were removed.
    pub async fn invalidate_user(&self, user_id: &str) -> u64 {
        let pattern = format!("{CACHE_PREFIX}:{user_id}:*");
        let keys = match self.kv.keys(&pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(%err, "cache invalidation scan failed");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }
        match self.kv.delete(&keys).await {
            Ok(count) => {
                info!(user_id, count, "invalidated user cache entries");
                count
            }
            Err(err) => {
                warn!(%err, "cache invalidation delete failed");
                0
            }
        }
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics.lock().snapshot()
    }

    /// Zero all metrics.
    pub fn reset_metrics(&self) {
        *self.metrics.lock() = MetricsInner::default();
    }

    fn record_miss(&self, start: Instant) {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let mut metrics = self.metrics.lock();
        if self.metrics_enabled {
            metrics.record_miss(elapsed_ms);
        } else {
            metrics.cache_misses += 1;
        }
    }
}

impl std::fmt::Debug for DiversityAwareCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiversityAwareCache")
            .field("metrics_enabled", &self.metrics_enabled)
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use crate::types::Recommendation;

    fn cache() -> DiversityAwareCache {
        DiversityAwareCache::new(Arc::new(InMemoryKvStore::new()), CategoryKeywords::builtin())
    }

    fn response(ids: &[&str]) -> RecommendationResponse {
        RecommendationResponse::new(
            ids.iter()
                .map(|id| Recommendation {
                    id: (*id).to_string(),
                    title: format!("Product {id}"),
                    description: String::new(),
                    price: 10.0,
                    category: "electronics".into(),
                    image_url: None,
                    score: 0.9,
                    source: "hybrid".into(),
                    incomplete_data: false,
                })
                .collect(),
        )
    }

    fn ctx(turn: u32, shown: &[&str]) -> RequestContext {
        RequestContext {
            turn_number: turn,
            shown_products: shown.iter().map(|s| (*s).to_string()).collect(),
            market_id: "US".into(),
            engagement_score: None,
        }
    }

    #[test]
    fn key_is_stable_across_calls() {
        let cache = cache();
        let context = ctx(1, &[]);
        let a = cache.cache_key("u1", "show me headphones", &context);
        let b = cache.cache_key("u1", "show me headphones", &context);
        assert_eq!(a, b);
        assert!(a.starts_with("diversity_cache_v2:u1:"));
    }

    #[test]
    fn key_changes_when_shown_products_differ() {
        let cache = cache();
        let a = cache.cache_key("u1", "show me headphones", &ctx(2, &[]));
        let b = cache.cache_key("u1", "show me headphones", &ctx(2, &["p1", "p2"]));
        assert_ne!(a, b);
    }

    #[test]
    fn same_intent_different_wording_shares_key() {
        let cache = cache();
        let context = ctx(1, &[]);
        let a = cache.cache_key("u1", "show me headphones", &context);
        let b = cache.cache_key("u1", "I need new headphones today", &context);
        assert_eq!(a, b);
    }

    #[test]
    fn ttl_schedule() {
        assert_eq!(
            DiversityAwareCache::dynamic_ttl(&ctx(1, &[])),
            Duration::from_secs(300)
        );
        let mut engaged = ctx(3, &[]);
        engaged.engagement_score = Some(0.9);
        assert_eq!(
            DiversityAwareCache::dynamic_ttl(&engaged),
            Duration::from_secs(30)
        );
        assert_eq!(
            DiversityAwareCache::dynamic_ttl(&ctx(2, &[])),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn miss_then_hit_with_tags() {
        let cache = cache();
        let context = ctx(1, &[]);
        assert!(cache.get_cached("u1", "show me headphones", &context).await.is_none());

        let resp = response(&["p1", "p2"]);
        assert!(cache.cache("u1", "show me headphones", &context, &resp, None).await);

        let hit = cache
            .get_cached("u1", "show me headphones", &context)
            .await
            .unwrap();
        assert_eq!(hit.recommendations, resp.recommendations);
        assert_eq!(
            hit.metadata.get("_cache_hit"),
            Some(&serde_json::Value::Bool(true))
        );
        assert!(hit.metadata.contains_key("_cache_key"));

        let metrics = cache.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
    }

    #[tokio::test]
    async fn follow_up_with_exclusions_misses() {
        let cache = cache();
        let initial = ctx(1, &[]);
        let resp = response(&["p1", "p2", "p3", "p4", "p5"]);
        cache.cache("u1", "show me headphones", &initial, &resp, None).await;

        let follow_up = ctx(2, &["p1", "p2", "p3", "p4", "p5"]);
        assert!(cache.get_cached("u1", "show me more", &follow_up).await.is_none());
        assert!(cache.metrics().diversification_preserved >= 1);
    }

    #[tokio::test]
    async fn envelope_round_trips_response() {
        let resp = response(&["p1"]);
        let envelope = CacheEnvelope {
            user_id: "u1".into(),
            query: "q".into(),
            response: resp.clone(),
            context_snapshot: ContextSnapshot {
                turn_number: 1,
                market_id: "US".into(),
                shown_products_count: 0,
            },
            cached_at: 0,
            expires_at: 300,
            ttl: 300,
        };
        let raw = serde_json::to_string(&envelope).unwrap();
        let back: CacheEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, envelope);
        assert_eq!(back.response, resp);
    }

    #[tokio::test]
    async fn invalidate_user_removes_only_their_entries() {
        let kv = Arc::new(InMemoryKvStore::new());
        let cache =
            DiversityAwareCache::new(kv.clone(), CategoryKeywords::builtin());
        let context = ctx(1, &[]);
        cache.cache("u1", "show me headphones", &context, &response(&["p1"]), None).await;
        cache.cache("u1", "show me a dress", &context, &response(&["p2"]), None).await;
        cache.cache("u2", "show me headphones", &context, &response(&["p3"]), None).await;

        let removed = cache.invalidate_user("u1").await;
        assert_eq!(removed, 2);
        assert!(cache.get_cached("u2", "show me headphones", &context).await.is_some());
    }
}
