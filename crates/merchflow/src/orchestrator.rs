// Copyright 2026 MerchFlow Contributors

//! Recommendation orchestrator
//!
//! The single consumer-facing operation: given `(user, query, context)`,
//! produce a ranked, enriched, diverse response. The orchestrator consults
//! the diversity cache first; on a miss it runs the hybrid recommender with
//! the conversation's shown products excluded, optionally asks the response
//! generator for conversational text, stores the result with a dynamic TTL
//! and submits a conversation-intent event to the event store.
//!
//! On total infrastructure outage the response is still non-empty: the
//! emergency placeholder list plus a generic conversational string, tagged
//! `error_fallback` in the metadata.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::diversity_cache::DiversityAwareCache;
use crate::events::EventStore;
use crate::hybrid::{emergency_placeholders, HybridRecommender};
use crate::intent::{extract_semantic_intent, CategoryKeywords};
use crate::kv::KvStore;
use crate::product_cache::ProductCache;
use crate::types::{
    HealthStatus, Recommendation, RecommendationResponse, RequestContext,
};

/// Default number of recommendations per response.
const DEFAULT_N: usize = 5;

/// Opaque conversational-response hook, invoked only when wired.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce conversational text for a result set, or `None` to stay
    /// silent.
    async fn generate(&self, query: &str, recommendations: &[Recommendation]) -> Option<String>;
}

/// Generator that never produces text.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResponseGenerator;

#[async_trait]
impl ResponseGenerator for NoopResponseGenerator {
    async fn generate(&self, _query: &str, _recommendations: &[Recommendation]) -> Option<String> {
        None
    }
}

/// Count-sensitive templated generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResponseGenerator;

#[async_trait]
impl ResponseGenerator for TemplateResponseGenerator {
    async fn generate(&self, query: &str, recommendations: &[Recommendation]) -> Option<String> {
        let query = query.trim();
        if recommendations.is_empty() {
            return Some(if query.is_empty() {
                "I'm sorry, I couldn't find any recommendations for you right now. Please try \
                 again in a moment."
                    .to_string()
            } else {
                format!(
                    "I couldn't find any products matching '{query}'. Could you try a different \
                     search term or browse our categories?"
                )
            });
        }

        let top = recommendations[0].title.as_str();
        let total = recommendations.len();
        Some(match total {
            1 => format!("I found one great match: {top}. It seems perfect for what you're looking for!"),
            2..=3 => format!(
                "I found {total} options for you. The top choice is '{top}'. Would you like more \
                 details about any of these?"
            ),
            _ => format!(
                "I've curated {total} recommendations for you, led by '{top}'. They're arranged \
                 by relevance to help you find what you need."
            ),
        })
    }
}

/// The request-path pipeline over the core subsystems.
pub struct RecommendationOrchestrator {
    diversity_cache: Arc<DiversityAwareCache>,
    recommender: Arc<HybridRecommender>,
    event_store: Option<Arc<EventStore>>,
    product_cache: Option<Arc<ProductCache>>,
    kv: Arc<dyn KvStore>,
    response_generator: Arc<dyn ResponseGenerator>,
    categories: CategoryKeywords,
    default_n: usize,
}

impl RecommendationOrchestrator {
    /// Create an orchestrator over the given components.
    #[must_use]
    pub fn new(
        diversity_cache: Arc<DiversityAwareCache>,
        recommender: Arc<HybridRecommender>,
        kv: Arc<dyn KvStore>,
        categories: CategoryKeywords,
    ) -> Self {
        Self {
            diversity_cache,
            recommender,
            event_store: None,
            product_cache: None,
            kv,
            response_generator: Arc::new(NoopResponseGenerator),
            categories,
            default_n: DEFAULT_N,
        }
    }

    /// Wire the event store used for intent logging and health.
    #[must_use]
    pub fn with_event_store(mut self, event_store: Arc<EventStore>) -> Self {
        self.event_store = Some(event_store);
        self
    }

    /// Wire the product cache for the metrics surface.
    #[must_use]
    pub fn with_product_cache(mut self, product_cache: Arc<ProductCache>) -> Self {
        self.product_cache = Some(product_cache);
        self
    }

    /// Replace the response generator.
    #[must_use]
    pub fn with_response_generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.response_generator = generator;
        self
    }

    /// Override the default response size.
    #[must_use]
    pub fn with_default_n(mut self, n: usize) -> Self {
        self.default_n = n.max(1);
        self
    }

    /// The one logical operation: a ranked, enriched, diverse response for
    /// this user, query and conversational context.
    pub async fn recommend(
        &self,
        user_id: &str,
        query: &str,
        context: &RequestContext,
    ) -> RecommendationResponse {
        let start = Instant::now();

        if let Some(cached) = self.diversity_cache.get_cached(user_id, query, context).await {
            debug!(user_id, "served from diversity cache");
            return cached;
        }

        let recommendations = self
            .recommender
            .recommend_excluding(user_id, None, self.default_n, &context.shown_products)
            .await;

        let mut response = if recommendations.is_empty() {
            // Total outage: every engine and every ladder rung came back
            // empty. Serve placeholders and say so in the metadata.
            warn!(user_id, "all recommendation sources empty, serving placeholders");
            let placeholders = emergency_placeholders(self.default_n, &Default::default());
            let mut response = RecommendationResponse::new(placeholders);
            response.ai_response = Some(
                "I apologize for the technical difficulty. Here are some products you might like."
                    .to_string(),
            );
            response.set_meta("error_fallback", true);
            response
        } else {
            let mut response = RecommendationResponse::new(recommendations);
            response.ai_response = self
                .response_generator
                .generate(query, &response.recommendations)
                .await;
            response
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        response.set_meta("processing_time_ms", elapsed_ms);
        response.set_meta("market_id", context.market_id.clone());
        response.set_meta("turn_number", context.turn_number);
        response.set_meta(
            "total_recommendations",
            response.recommendations.len() as u64,
        );
        if !response.metadata.contains_key("source") {
            response.set_meta("source", "hybrid");
        }

        // Degraded placeholder responses are never cached; a healthy result
        // should replace them as soon as the backends recover.
        if !response
            .metadata
            .get("error_fallback")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            self.diversity_cache
                .cache(user_id, query, context, &response, None)
                .await;
        }

        // Submitting the intent event only buffers it; persistence happens
        // on the store's flush cadence.
        if let Some(store) = &self.event_store {
            let intent = extract_semantic_intent(query, &self.categories);
            store
                .record_conversation_intent(
                    user_id,
                    &intent,
                    query,
                    Some(context.market_id.clone()),
                )
                .await;
        }

        info!(
            user_id,
            count = response.recommendations.len(),
            elapsed_ms,
            "recommendation response assembled"
        );
        response
    }

    /// Aggregated health across the wired components.
    pub async fn health_check(&self) -> HashMap<String, Value> {
        let kv_health = self.kv.health_check().await;
        let events_status = match &self.event_store {
            Some(store) => store.health_check().await,
            None => HealthStatus::Disconnected,
        };

        let overall = match (kv_health.status, events_status) {
            (HealthStatus::Healthy, HealthStatus::Healthy | HealthStatus::Disconnected) => {
                HealthStatus::Healthy
            }
            (HealthStatus::Unhealthy, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };

        let mut services = serde_json::Map::new();
        services.insert("kv".into(), serde_json::to_value(&kv_health).unwrap_or(Value::Null));
        services.insert(
            "events".into(),
            serde_json::to_value(events_status).unwrap_or(Value::Null),
        );
        services.insert(
            "cache".into(),
            serde_json::to_value(self.diversity_cache.metrics()).unwrap_or(Value::Null),
        );
        services.insert("recommender".into(), Value::String("ready".into()));

        let mut out = HashMap::new();
        out.insert(
            "status".to_string(),
            serde_json::to_value(overall).unwrap_or(Value::Null),
        );
        out.insert("services".to_string(), Value::Object(services));
        out.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        out
    }

    /// Union of the per-component metric maps.
    pub async fn metrics(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        out.insert(
            "diversity_cache".to_string(),
            serde_json::to_value(self.diversity_cache.metrics()).unwrap_or(Value::Null),
        );
        out.insert(
            "kv".to_string(),
            serde_json::to_value(self.kv.stats()).unwrap_or(Value::Null),
        );
        if let Some(cache) = &self.product_cache {
            out.insert(
                "product_cache".to_string(),
                serde_json::to_value(cache.get_stats()).unwrap_or(Value::Null),
            );
        }
        if let Some(store) = &self.event_store {
            out.insert(
                "event_store".to_string(),
                serde_json::to_value(store.stats().await).unwrap_or(Value::Null),
            );
        }
        out
    }
}

impl std::fmt::Debug for RecommendationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationOrchestrator")
            .field("default_n", &self.default_n)
            .field("events", &self.event_store.is_some())
            .finish()
    }
}
