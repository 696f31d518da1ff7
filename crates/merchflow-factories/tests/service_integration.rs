//! End-to-end scenarios through the factory-wired core.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};

use merchflow::collaborative::StaticCollaborativeEngine;
use merchflow::error::{Error, Result};
use merchflow::events::RecordOptions;
use merchflow::kv::{KvHealth, KvStats, KvStore};
use merchflow::types::{
    EventType, HealthStatus, Product, RequestContext, ScoredId,
};
use merchflow::Settings;
use merchflow_factories::ServiceFactory;

fn product(id: &str, title: &str, category: &str) -> Product {
    Product {
        id: id.into(),
        title: title.into(),
        description: format!("{title} for every day"),
        price: 25.0,
        currency: "USD".into(),
        category: category.into(),
        image_urls: vec![format!("https://img.test/{id}.jpg")],
        metadata: BTreeMap::new(),
        is_minimal: false,
    }
}

fn catalog() -> Vec<Product> {
    vec![
        product("p1", "Wireless Headphones", "audio"),
        product("p2", "Bluetooth Speaker", "audio"),
        product("p3", "Studio Headphones", "audio"),
        product("p4", "Running Shoes", "sports"),
        product("p5", "Yoga Mat", "sports"),
        product("p6", "Desk Lamp", "home"),
        product("p7", "Table Clock", "home"),
        product("p8", "Face Cream", "beauty"),
    ]
}

fn factory_with_candidates(candidates: Vec<ScoredId>) -> ServiceFactory {
    let factory = ServiceFactory::new(Settings::default()).with_catalog(catalog());
    factory.install_collaborative(Arc::new(StaticCollaborativeEngine::with_candidates(
        candidates,
    )));
    factory
}

#[tokio::test]
async fn diversity_on_follow_up() {
    let factory = factory_with_candidates(vec![
        ScoredId::new("p1", 1.0),
        ScoredId::new("p2", 0.9),
        ScoredId::new("p3", 0.8),
        ScoredId::new("p4", 0.7),
        ScoredId::new("p5", 0.6),
    ]);
    let orchestrator = factory.orchestrator().await;

    let initial = RequestContext::initial("US");
    let first = orchestrator
        .recommend("u1", "show me headphones", &initial)
        .await;
    assert!(first.metadata.get("_cache_hit").is_none());
    let shown: Vec<String> = first.recommendations.iter().map(|r| r.id.clone()).collect();
    assert_eq!(shown.len(), 5);

    let follow_up = RequestContext {
        turn_number: 2,
        shown_products: shown.clone(),
        market_id: "US".into(),
        engagement_score: None,
    };
    let second = orchestrator.recommend("u1", "show me more", &follow_up).await;

    // Different key, so a miss: the recommender ran again and none of the
    // shown products reappear.
    assert!(second.metadata.get("_cache_hit").is_none());
    assert!(!second.recommendations.is_empty());
    for rec in &second.recommendations {
        assert!(!shown.contains(&rec.id), "{} was already shown", rec.id);
    }
}

#[tokio::test]
async fn cache_hit_on_identical_repeat() {
    let factory = factory_with_candidates(vec![
        ScoredId::new("p1", 1.0),
        ScoredId::new("p2", 0.9),
    ]);
    let orchestrator = factory.orchestrator().await;
    let context = RequestContext::initial("US");

    let first = orchestrator
        .recommend("u2", "recommend something nice", &context)
        .await;

    let start = Instant::now();
    let second = orchestrator
        .recommend("u2", "recommend something nice", &context)
        .await;
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(second.metadata.get("_cache_hit"), Some(&Value::Bool(true)));
    assert_eq!(second.recommendations, first.recommendations);
}

#[tokio::test]
async fn event_bulk_flush_at_threshold() {
    let factory = ServiceFactory::new(Settings::default()).with_catalog(catalog());
    let store = factory.event_store().await;
    let kv = factory.kv_store().await;

    // One over the buffer threshold (200): exactly one bulk flush fires.
    for i in 0..201 {
        let mut data = Map::new();
        data.insert("product_id".into(), Value::String(format!("p{i}")));
        data.insert("product_category".into(), Value::String("audio".into()));
        assert!(
            store
                .record("u3", EventType::ProductView, data, RecordOptions::default())
                .await
        );
    }

    let metrics = store.stats().await;
    assert_eq!(metrics.events_buffered, 201);
    assert_eq!(metrics.bulk_operations, 1);
    assert_eq!(metrics.events_stored, 200);
    assert_eq!(metrics.pending_buffer_size, 1);

    // Drain the remainder and verify the key space.
    store.flush().await;
    let stored_events = kv.keys("event:*").await.unwrap();
    assert_eq!(stored_events.len(), 201);

    let events = store.user_events("u3").await.unwrap();
    assert_eq!(events.len(), 201);
    // Newest at the head.
    assert_eq!(events[0].product_id(), Some("p200"));
    assert_eq!(events[200].product_id(), Some("p0"));
}

#[tokio::test]
async fn profile_regeneration_through_factory() {
    let factory = ServiceFactory::new(Settings::default()).with_catalog(catalog());
    let store = factory.event_store().await;
    let kv = factory.kv_store().await;

    let categories = ["audio", "audio", "audio", "audio", "sports", "sports", "sports",
                      "home", "home", "home"];
    for (i, category) in categories.iter().enumerate() {
        let mut data = Map::new();
        data.insert("product_id".into(), Value::String(format!("p{i}")));
        data.insert("product_category".into(), Value::String((*category).into()));
        store
            .record(
                "u4",
                EventType::ProductView,
                data,
                RecordOptions {
                    session_id: Some("s1".into()),
                    ..RecordOptions::default()
                },
            )
            .await;
    }
    store.flush().await;

    let profile = store.get_profile("u4").await;
    assert_eq!(profile.total_events, 10);
    assert!((profile.category_affinity["audio"] - 0.4).abs() < 1e-9);
    assert!((profile.category_affinity["sports"] - 0.3).abs() < 1e-9);
    assert!((profile.category_affinity["home"] - 0.3).abs() < 1e-9);
    assert_eq!(
        serde_json::to_value(profile.activity_level).unwrap(),
        Value::String("low".into())
    );
    assert!(kv.get("user:profile:u4").await.unwrap().is_some());
}

#[tokio::test]
async fn journal_recovery_through_factory() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.event_fallback_dir = Some(dir.path().to_path_buf());

    let factory = ServiceFactory::new(settings).with_catalog(catalog());
    let store = factory.event_store().await;
    let kv = factory.kv_store().await;

    // Write path down: the flush spills the batch to the journal.
    store.write_breaker().force_open().await;
    for i in 0..20 {
        let mut data = Map::new();
        data.insert("product_id".into(), Value::String(format!("p{i}")));
        store
            .record("u6", EventType::ProductView, data, RecordOptions::default())
            .await;
    }
    assert!(!store.flush().await);
    let journal_count = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("events_fallback_"))
        .count();
    assert_eq!(journal_count, 1);

    // Write path healed: recovery drains the failed buffer and replays the
    // journal, leaving no fallback files behind.
    store.write_breaker().reset().await;
    store.recovery_tick().await;
    store.recovery_tick().await;

    assert_eq!(kv.keys("event:*").await.unwrap().len(), 20);
    let remaining = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("events_fallback_"))
        .count();
    assert_eq!(remaining, 0);
    assert!(store.stats().await.recovery_operations >= 1);
}

// ============================================================================
// KV outage degradation
// ============================================================================

/// A store where every data operation fails.
#[derive(Debug, Default)]
struct FailingKvStore;

#[async_trait]
impl KvStore for FailingKvStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::KvUnavailable("injected outage".into()))
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<bool> {
        Err(Error::KvUnavailable("injected outage".into()))
    }
    async fn delete(&self, _keys: &[String]) -> Result<u64> {
        Err(Error::KvUnavailable("injected outage".into()))
    }
    async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
        Err(Error::KvUnavailable("injected outage".into()))
    }
    async fn ping(&self) -> Result<Duration> {
        Err(Error::KvUnavailable("injected outage".into()))
    }
    async fn info(&self) -> Result<HashMap<String, String>> {
        Err(Error::KvUnavailable("injected outage".into()))
    }
    async fn health_check(&self) -> KvHealth {
        KvHealth {
            status: HealthStatus::Unhealthy,
            connected: false,
            latency_ms: None,
            last_test: "failed: injected outage".into(),
        }
    }
    fn stats(&self) -> KvStats {
        KvStats::default()
    }
}

#[tokio::test]
async fn kv_outage_degrades_to_ladder() {
    let factory = ServiceFactory::new(Settings::default()).with_catalog(catalog());
    factory.install_kv(Arc::new(FailingKvStore));
    factory.install_collaborative(Arc::new(StaticCollaborativeEngine::empty()));
    let orchestrator = factory.orchestrator().await;

    let context = RequestContext::initial("US");

    // Cache lookups fail fast and report misses.
    let start = Instant::now();
    let response = orchestrator.recommend("u5", "show me headphones", &context).await;
    assert!(start.elapsed() < Duration::from_secs(2));

    // The recommender still serves from the local fallback ladder.
    assert!(!response.recommendations.is_empty());

    let cache = factory.diversity_cache().await;
    let metrics = cache.metrics();
    assert!(metrics.cache_misses >= 1);
    assert_eq!(metrics.cache_hits, 0);

    // Aggregated health reflects the outage without failing the call.
    let health = orchestrator.health_check().await;
    assert!(health.contains_key("status"));
}
