// Copyright 2026 MerchFlow Contributors

//! Resilient, diversity-aware recommendation serving core
//!
//! MerchFlow sits in front of three heterogeneous recommendation backends
//! (a local content-similarity engine, a remote collaborative-filtering
//! engine, and a remote product catalog) and serves personalized product
//! recommendations under conversational refinement.
//!
//! The crate is organized around four load-bearing subsystems:
//!
//! 1. **Diversity-aware cache** ([`diversity_cache`]) - a personalization
//!    cache whose keys are derived from user identity, semantic intent,
//!    conversational turn, and the set of products already shown, so cache
//!    hits never break conversational diversification.
//! 2. **Hybrid recommender** ([`hybrid`]) - weighted fusion of a content
//!    engine and a collaborative engine, with seen-product exclusion and a
//!    multi-layer fallback ladder.
//! 3. **Resilient event store** ([`events`]) - append-only user event log
//!    with write buffering, bulk flush, dual circuit breakers, an on-disk
//!    fallback journal and lazy profile materialization.
//! 4. **Multi-tier product cache** ([`product_cache`]) - read-through
//!    product lookup across KV, local catalog and remote catalog tiers with
//!    access-pattern telemetry and a warm-up planner.
//!
//! The KV store itself is abstracted behind the [`kv::KvStore`] trait; a
//! live Redis implementation lives in the `merchflow-redis` crate and the
//! in-memory twin ([`kv::InMemoryKvStore`]) doubles as both test double and
//! degraded-mode fallback. Service construction and lifecycle is owned by
//! the `merchflow-factories` crate.

pub mod circuit_breaker;
pub mod collaborative;
pub mod config;
pub mod content;
pub mod diversity_cache;
pub mod error;
pub mod events;
pub mod hybrid;
pub mod intent;
pub mod kv;
pub mod orchestrator;
pub mod product_cache;
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use collaborative::{CollaborativeEngine, RemoteCollaborativeClient, StaticCollaborativeEngine};
pub use config::Settings;
pub use content::ContentEngine;
pub use diversity_cache::{CacheMetrics, DiversityAwareCache};
pub use error::{Error, Result};
pub use events::{EventStore, EventStoreConfig};
pub use hybrid::HybridRecommender;
pub use intent::CategoryKeywords;
pub use kv::{InMemoryKvStore, KvHealth, KvStore};
pub use orchestrator::{
    NoopResponseGenerator, RecommendationOrchestrator, ResponseGenerator,
    TemplateResponseGenerator,
};
pub use product_cache::{ProductCache, RemoteCatalog};
pub use types::{
    ActivityLevel, EventType, HealthStatus, Product, Recommendation, RecommendationResponse,
    RequestContext, ScoredId, UserEvent, UserProfile,
};
