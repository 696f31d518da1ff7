// Copyright 2026 MerchFlow Contributors

//! Shared data model for the recommendation core
//!
//! Every record persisted to the KV store (products, events, profiles,
//! cache envelopes) is serde-derived and round-trips through JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Aggregated component health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Operating with a degraded path (e.g. one circuit breaker open).
    Degraded,
    /// Not operational.
    Unhealthy,
    /// No backing connection was ever established.
    Disconnected,
}

/// A product record. Owned by the remote catalog; the core holds
/// short-lived copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Stable product ID.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Unit price.
    #[serde(default)]
    pub price: f64,
    /// ISO currency code.
    #[serde(default)]
    pub currency: String,
    /// Category tag.
    #[serde(default)]
    pub category: String,
    /// Image URLs, first is primary.
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Arbitrary metadata carried through unchanged.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Marks a synthesized placeholder record that should be replaced by a
    /// real one as soon as a tier can supply it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_minimal: bool,
}

impl Product {
    /// Minimal placeholder product synthesized when every lookup tier
    /// misses and minimal products are enabled.
    #[must_use]
    pub fn minimal(product_id: &str) -> Self {
        Self {
            id: product_id.to_string(),
            title: format!("Product {product_id}"),
            description: format!("Information not yet available for product {product_id}"),
            price: 0.0,
            currency: String::new(),
            category: "unknown".to_string(),
            image_urls: Vec::new(),
            metadata: BTreeMap::new(),
            is_minimal: true,
        }
    }
}

/// User event types accepted by the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A product detail view.
    #[serde(rename = "product-view")]
    ProductView,
    /// A free-text product search.
    #[serde(rename = "product-search")]
    ProductSearch,
    /// An add-to-cart action.
    #[serde(rename = "add-to-cart")]
    AddToCart,
    /// A completed purchase.
    #[serde(rename = "purchase")]
    Purchase,
    /// A conversational intent captured from the chat surface.
    #[serde(rename = "conversation-intent")]
    ConversationIntent,
    /// Anything else.
    #[serde(rename = "generic")]
    Generic,
}

impl EventType {
    /// Stable wire name, equal to the serde rename.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductView => "product-view",
            Self::ProductSearch => "product-search",
            Self::AddToCart => "add-to-cart",
            Self::Purchase => "purchase",
            Self::ConversationIntent => "conversation-intent",
            Self::Generic => "generic",
        }
    }

    /// Event types that mark a product as "seen" for exclusion purposes.
    #[must_use]
    pub fn counts_as_seen(&self) -> bool {
        matches!(self, Self::ProductView | Self::AddToCart | Self::Purchase)
    }
}

/// An append-only user event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    /// Generated, globally unique event ID.
    pub event_id: String,
    /// User the event belongs to.
    pub user_id: String,
    /// Event type.
    pub event_type: EventType,
    /// UTC wall-clock timestamp; never in the future.
    pub timestamp: DateTime<Utc>,
    /// Session the event occurred in, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Market the event occurred in, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_id: Option<String>,
    /// Request origin IP, if captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Request user agent, if captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Schema-validated event payload.
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

impl UserEvent {
    /// Product referenced by this event, if its payload carries one.
    #[must_use]
    pub fn product_id(&self) -> Option<&str> {
        self.data.get("product_id").and_then(Value::as_str)
    }
}

/// Coarse user activity classification derived from the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    /// Fewer than 5 events.
    New,
    /// Light usage.
    Low,
    /// Regular usage.
    Medium,
    /// Heavy usage.
    High,
}

/// Derived per-user summary, materialized lazily from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User the profile describes.
    pub user_id: String,
    /// Total events observed.
    pub total_events: usize,
    /// Earliest observed activity.
    pub first_activity: DateTime<Utc>,
    /// Latest observed activity.
    pub last_activity: DateTime<Utc>,
    /// Last 10 conversational intent payloads, newest first.
    #[serde(default)]
    pub intent_history: Vec<serde_json::Map<String, Value>>,
    /// Per-category affinity normalized to [0, 1]; sums to 1 over observed
    /// categories.
    #[serde(default)]
    pub category_affinity: BTreeMap<String, f64>,
    /// Last 20 search queries, newest first.
    #[serde(default)]
    pub search_patterns: Vec<String>,
    /// Count of distinct sessions.
    pub session_count: usize,
    /// Event counts per market.
    #[serde(default)]
    pub market_preferences: BTreeMap<String, u64>,
    /// Last 10 purchase payloads, newest first.
    #[serde(default)]
    pub purchase_history: Vec<serde_json::Map<String, Value>>,
    /// Span of activity in days; same-day activity counts as 1.
    pub days_active: i64,
    /// Coarse activity classification.
    pub activity_level: ActivityLevel,
    /// When the profile was materialized.
    pub generated_at: DateTime<Utc>,
    /// Provenance: "generated", "fallback" or "offline".
    pub source: String,
    /// Set when a degraded read path produced this profile:
    /// "expired_cache" or "generated_empty".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl UserProfile {
    /// Empty profile for a new user or as a read fallback.
    #[must_use]
    pub fn empty(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            total_events: 0,
            first_activity: now,
            last_activity: now,
            intent_history: Vec::new(),
            category_affinity: BTreeMap::new(),
            search_patterns: Vec::new(),
            session_count: 0,
            market_preferences: BTreeMap::new(),
            purchase_history: Vec::new(),
            days_active: 0,
            activity_level: ActivityLevel::New,
            generated_at: now,
            source: "fallback".to_string(),
            fallback: None,
        }
    }
}

/// Conversational request context carried with every recommendation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Conversational round number, starting at 1.
    pub turn_number: u32,
    /// Product IDs already shown to the user in this conversation.
    #[serde(default)]
    pub shown_products: Vec<String>,
    /// Market the request originates from.
    pub market_id: String,
    /// Optional engagement score in [0, 1]; high engagement shortens cache
    /// TTLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement_score: Option<f64>,
}

impl RequestContext {
    /// Context for the first turn of a conversation.
    #[must_use]
    pub fn initial(market_id: &str) -> Self {
        Self {
            turn_number: 1,
            shown_products: Vec::new(),
            market_id: market_id.to_string(),
            engagement_score: None,
        }
    }
}

/// A candidate product ID with its engine-assigned score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    /// Product ID.
    pub id: String,
    /// Engine score; larger is better.
    pub score: f64,
}

impl ScoredId {
    /// Convenience constructor.
    #[must_use]
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self { id: id.into(), score }
    }
}

/// An enriched, ranked recommendation returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Product ID.
    pub id: String,
    /// Product title; synthetic when enrichment found no record.
    pub title: String,
    /// Product description.
    #[serde(default)]
    pub description: String,
    /// Unit price.
    #[serde(default)]
    pub price: f64,
    /// Category tag.
    #[serde(default)]
    pub category: String,
    /// Primary image URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Combined ranking score.
    pub score: f64,
    /// Which path produced this recommendation ("hybrid", "content",
    /// "collaborative", a fallback rung, ...).
    pub source: String,
    /// Set when enrichment could not find a product record and the textual
    /// fields are placeholders.
    #[serde(
        default,
        rename = "_incomplete_data",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub incomplete_data: bool,
}

impl Recommendation {
    /// Bare recommendation from a scored candidate, before enrichment.
    #[must_use]
    pub fn from_candidate(candidate: &ScoredId, source: &str) -> Self {
        Self {
            id: candidate.id.clone(),
            title: String::new(),
            description: String::new(),
            price: 0.0,
            category: String::new(),
            image_url: None,
            score: candidate.score,
            source: source.to_string(),
            incomplete_data: false,
        }
    }
}

/// The consumer-facing result of one `recommend` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResponse {
    /// Ranked, enriched recommendations.
    pub recommendations: Vec<Recommendation>,
    /// Conversational response text, when a generator is wired and produced
    /// one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_response: Option<String>,
    /// Free-form response metadata (processing time, cache tags, market,
    /// fallback flags).
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl RecommendationResponse {
    /// Response wrapping a recommendation list with empty metadata.
    #[must_use]
    pub fn new(recommendations: Vec<Recommendation>) -> Self {
        Self {
            recommendations,
            ai_response: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Insert a metadata entry, replacing any previous value.
    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names_are_stable() {
        for (ty, name) in [
            (EventType::ProductView, "product-view"),
            (EventType::ProductSearch, "product-search"),
            (EventType::AddToCart, "add-to-cart"),
            (EventType::Purchase, "purchase"),
            (EventType::ConversationIntent, "conversation-intent"),
            (EventType::Generic, "generic"),
        ] {
            assert_eq!(ty.as_str(), name);
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{name}\""));
        }
    }

    #[test]
    fn seen_classification_covers_commerce_events() {
        assert!(EventType::ProductView.counts_as_seen());
        assert!(EventType::AddToCart.counts_as_seen());
        assert!(EventType::Purchase.counts_as_seen());
        assert!(!EventType::ProductSearch.counts_as_seen());
        assert!(!EventType::ConversationIntent.counts_as_seen());
    }

    #[test]
    fn event_round_trips_through_json() {
        let mut data = serde_json::Map::new();
        data.insert("product_id".into(), Value::String("p-1".into()));
        let event = UserEvent {
            event_id: "evt_1".into(),
            user_id: "u1".into(),
            event_type: EventType::ProductView,
            timestamp: Utc::now(),
            session_id: Some("s1".into()),
            market_id: Some("US".into()),
            ip_address: None,
            user_agent: None,
            data,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: UserEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.product_id(), Some("p-1"));
    }

    #[test]
    fn minimal_product_is_marked() {
        let p = Product::minimal("p-9");
        assert!(p.is_minimal);
        assert_eq!(p.id, "p-9");
        assert!(p.title.contains("p-9"));
    }

    #[test]
    fn response_metadata_can_be_tagged() {
        let mut resp = RecommendationResponse::new(Vec::new());
        resp.set_meta("error_fallback", true);
        assert_eq!(resp.metadata.get("error_fallback"), Some(&Value::Bool(true)));
    }
}
