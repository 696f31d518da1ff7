// Copyright 2026 MerchFlow Contributors

//! Multi-tier read-through product cache
//!
//! Source precedence on lookup:
//!
//! 1. KV store (`product:<id>`)
//! 2. Local catalog (the content engine's product table)
//! 3. Remote catalog
//! 4. Minimal-product synthesis (flag-gated, short TTL)
//!
//! Any hit from tier 2 onward is written back to the KV tier so the next
//! lookup is one round trip. Every lookup feeds access-pattern telemetry
//! (frequency, recency, per-market popularity, category demand) which the
//! warm-up planner and the adaptive maintenance task consume.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::content::ContentEngine;
use crate::error::Result;
use crate::kv::{self, KvStore};
use crate::types::Product;

/// TTL applied to synthesized minimal products so a real record replaces
/// them quickly.
const MINIMAL_PRODUCT_TTL: Duration = Duration::from_secs(300);

/// Recency window for trending classification.
const TRENDING_WINDOW: Duration = Duration::from_secs(2 * 3600);

/// Access age after which a cached product counts as stale.
const STALE_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Market bucket used when a caller supplies no market.
const DEFAULT_MARKET: &str = "default";

/// An opaque remote product source.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Fetch a product record, `None` when the catalog has no such product.
    async fn fetch_product(&self, product_id: &str) -> Result<Option<Product>>;
}

/// Per-tier hit counters and failure totals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductCacheStats {
    /// Lookups served.
    pub total_requests: u64,
    /// Tier-1 hits.
    pub kv_hits: u64,
    /// Tier-1 misses.
    pub kv_misses: u64,
    /// Tier-2 hits.
    pub local_catalog_hits: u64,
    /// Tier-3 hits.
    pub remote_catalog_hits: u64,
    /// Synthesized minimal products served.
    pub minimal_products_served: u64,
    /// Lookups where every tier missed.
    pub total_failures: u64,
    /// Overall hit ratio.
    pub hit_ratio: f64,
    /// Most frequently accessed product IDs with their counts.
    pub access_frequency_top10: Vec<(String, u64)>,
    /// Observed demand per category.
    pub category_stats: HashMap<String, u64>,
    /// Number of distinct products tracked per market.
    pub market_popularity_summary: HashMap<String, usize>,
}

/// Outcome of a warm-up run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupReport {
    /// Products preloaded across all markets.
    pub total_preloaded: usize,
    /// Markets processed.
    pub markets_processed: usize,
    /// Wall-clock spent.
    pub elapsed_ms: u64,
}

/// Outcome of one adaptive maintenance pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Stale products invalidated from the KV tier.
    pub obsolete_cleaned: usize,
    /// Trending products re-preloaded.
    pub trending_preloaded: usize,
}

#[derive(Debug, Default)]
struct TierCounters {
    total_requests: AtomicU64,
    kv_hits: AtomicU64,
    kv_misses: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    minimal_served: AtomicU64,
    total_failures: AtomicU64,
}

/// The multi-tier product cache.
pub struct ProductCache {
    kv: Arc<dyn KvStore>,
    local_catalog: Option<Arc<ContentEngine>>,
    remote_catalog: Option<Arc<dyn RemoteCatalog>>,
    ttl: Duration,
    prefix: String,
    minimal_products: bool,
    counters: TierCounters,
    access_frequency: DashMap<String, u64>,
    last_access: DashMap<String, Instant>,
    market_popularity: DashMap<(String, String), u64>,
    category_counts: DashMap<String, u64>,
}

impl ProductCache {
    /// Create a cache over the given tiers.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        local_catalog: Option<Arc<ContentEngine>>,
        remote_catalog: Option<Arc<dyn RemoteCatalog>>,
        ttl: Duration,
        prefix: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        info!(ttl_s = ttl.as_secs(), %prefix, "product cache initialized");
        Self {
            kv,
            local_catalog,
            remote_catalog,
            ttl,
            prefix,
            minimal_products: false,
            counters: TierCounters::default(),
            access_frequency: DashMap::new(),
            last_access: DashMap::new(),
            market_popularity: DashMap::new(),
            category_counts: DashMap::new(),
        }
    }

    /// Enable minimal-product synthesis when every tier misses.
    #[must_use]
    pub fn with_minimal_products(mut self, enabled: bool) -> Self {
        self.minimal_products = enabled;
        self
    }

    fn kv_key(&self, product_id: &str) -> String {
        format!("{}{}", self.prefix, product_id)
    }

    /// Look up a product without market attribution.
    pub async fn get_product(&self, product_id: &str) -> Option<Product> {
        self.get_product_in_market(product_id, None).await
    }

    /// Look up a product, attributing the access to a market for the
    /// popularity telemetry.
    pub async fn get_product_in_market(
        &self,
        product_id: &str,
        market_id: Option<&str>,
    ) -> Option<Product> {
        if product_id.is_empty() {
            warn!("product lookup with empty ID");
            return None;
        }
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        *self.access_frequency.entry(product_id.to_string()).or_insert(0) += 1;
        self.last_access.insert(product_id.to_string(), Instant::now());

        // Tier 1: KV
        match kv::get_json::<Product>(self.kv.as_ref(), &self.kv_key(product_id)).await {
            Ok(Some(product)) => {
                self.counters.kv_hits.fetch_add(1, Ordering::Relaxed);
                self.record_demand(&product, market_id);
                debug!(product_id, "product served from KV tier");
                return Some(product);
            }
            Ok(None) => {
                self.counters.kv_misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.kv_misses.fetch_add(1, Ordering::Relaxed);
                debug!(product_id, %err, "KV tier unavailable");
            }
        }

        // Tier 2: local catalog
        if let Some(catalog) = &self.local_catalog {
            if let Some(product) = catalog.get_product(product_id).cloned() {
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                self.record_demand(&product, market_id);
                self.write_back(&product, self.ttl).await;
                debug!(product_id, "product served from local catalog");
                return Some(product);
            }
        }

        // Tier 3: remote catalog
        if let Some(remote) = &self.remote_catalog {
            match remote.fetch_product(product_id).await {
                Ok(Some(product)) => {
                    self.counters.remote_hits.fetch_add(1, Ordering::Relaxed);
                    self.record_demand(&product, market_id);
                    self.write_back(&product, self.ttl).await;
                    debug!(product_id, "product served from remote catalog");
                    return Some(product);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(product_id, %err, "remote catalog lookup failed");
                }
            }
        }

        // Tier 4: minimal synthesis
        if self.minimal_products {
            warn!(product_id, "synthesizing minimal product");
            self.counters.minimal_served.fetch_add(1, Ordering::Relaxed);
            let product = Product::minimal(product_id);
            self.write_back(&product, MINIMAL_PRODUCT_TTL).await;
            return Some(product);
        }

        self.counters.total_failures.fetch_add(1, Ordering::Relaxed);
        warn!(product_id, "product not found in any tier");
        None
    }

    async fn write_back(&self, product: &Product, ttl: Duration) {
        let key = self.kv_key(&product.id);
        if let Err(err) = kv::set_json(self.kv.as_ref(), &key, product, Some(ttl)).await {
            debug!(product_id = %product.id, %err, "write-back to KV tier failed");
        }
    }

    fn record_demand(&self, product: &Product, market_id: Option<&str>) {
        let market = market_id.unwrap_or(DEFAULT_MARKET).to_string();
        *self
            .market_popularity
            .entry((market, product.id.clone()))
            .or_insert(0) += 1;
        let category = if product.category.is_empty() {
            "unknown".to_string()
        } else {
            product.category.clone()
        };
        *self.category_counts.entry(category).or_insert(0) += 1;
    }

    /// Fan out lookups for a batch of products under a concurrency limit.
    pub async fn preload(&self, product_ids: &[String], concurrency: usize) {
        if product_ids.is_empty() {
            return;
        }
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let tasks = product_ids.iter().map(|id| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                // Semaphore is never closed, so acquire cannot fail.
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let _ = self.get_product(id).await;
            }
        });
        join_all(tasks).await;
        info!(count = product_ids.len(), "products preloaded");
    }

    /// Invalidate a product's KV entry.
    pub async fn invalidate(&self, product_id: &str) -> bool {
        match self.kv.delete(&[self.kv_key(product_id)]).await {
            Ok(count) => count > 0,
            Err(err) => {
                debug!(product_id, %err, "invalidate failed");
                false
            }
        }
    }

    /// Invalidate a batch of products, returning how many entries existed.
    pub async fn invalidate_many(&self, product_ids: &[String]) -> u64 {
        let keys: Vec<String> = product_ids.iter().map(|id| self.kv_key(id)).collect();
        match self.kv.delete(&keys).await {
            Ok(count) => count,
            Err(err) => {
                debug!(%err, "bulk invalidate failed");
                0
            }
        }
    }

    /// Product IDs currently cached in the KV tier.
    pub async fn cached_product_ids(&self) -> Vec<String> {
        let pattern = format!("{}*", self.prefix);
        match self.kv.keys(&pattern).await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
                .filter(|id| !id.is_empty())
                .collect(),
            Err(err) => {
                debug!(%err, "cached ID scan failed");
                Vec::new()
            }
        }
    }

    // ========================================================================
    // Warm-up planning
    // ========================================================================

    /// Most popular product IDs for a market, by observed access count.
    /// Falls back to currently-cached IDs, then to a deterministic sample
    /// of the local catalog.
    pub async fn popular_products(&self, market_id: &str, limit: usize) -> Vec<String> {
        let mut observed: Vec<(String, u64)> = self
            .market_popularity
            .iter()
            .filter(|entry| entry.key().0 == market_id)
            .map(|entry| (entry.key().1.clone(), *entry.value()))
            .collect();
        if !observed.is_empty() {
            observed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            return observed.into_iter().take(limit).map(|(id, _)| id).collect();
        }

        let cached = self.cached_product_ids().await;
        if !cached.is_empty() {
            return cached.into_iter().take(limit).collect();
        }

        // No telemetry yet: pseudo-popularity over the catalog, stable per
        // market so repeated warm-ups load the same set.
        if let Some(catalog) = &self.local_catalog {
            let mut scored: Vec<(String, u64)> = catalog
                .products()
                .iter()
                .map(|p| {
                    let score = stable_hash(&format!("{market_id}_{}", p.id)) % 1000;
                    (p.id.clone(), score)
                })
                .collect();
            scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            return scored.into_iter().take(limit).map(|(id, _)| id).collect();
        }
        Vec::new()
    }

    /// Most frequently accessed product IDs overall.
    #[must_use]
    pub fn frequently_accessed(&self, limit: usize) -> Vec<String> {
        let mut entries: Vec<(String, u64)> = self
            .access_frequency
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.into_iter().take(limit).map(|(id, _)| id).collect()
    }

    /// Products accessed within the trending window, scored by frequency
    /// decayed by recency.
    #[must_use]
    pub fn trending(&self, limit: usize) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = self
            .last_access
            .iter()
            .filter_map(|entry| {
                let age = entry.value().elapsed();
                if age > TRENDING_WINDOW {
                    return None;
                }
                let frequency = self
                    .access_frequency
                    .get(entry.key())
                    .map(|f| *f)
                    .unwrap_or(1) as f64;
                let hours = age.as_secs_f64() / 3600.0;
                Some((entry.key().clone(), frequency / (hours + 1.0)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.into_iter().take(limit).map(|(id, _)| id).collect()
    }

    /// Product IDs drawn evenly from the top categories by observed demand.
    #[must_use]
    pub fn popular_category_products(&self, limit: usize) -> Vec<String> {
        let Some(catalog) = &self.local_catalog else {
            return Vec::new();
        };
        let mut categories: Vec<(String, u64)> = self
            .category_counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        if categories.is_empty() {
            return Vec::new();
        }
        categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        categories.truncate(3);

        let per_category = (limit / categories.len()).max(1);
        let mut out = Vec::new();
        for (category, _) in &categories {
            let ids = catalog
                .products()
                .iter()
                .filter(|p| p.category.eq_ignore_ascii_case(category))
                .take(per_category)
                .map(|p| p.id.clone());
            out.extend(ids);
        }
        out.truncate(limit);
        out
    }

    /// Compose and preload a warm-up set for the given markets.
    ///
    /// Per market the load set combines top popularity, most-frequent,
    /// trending and top-category IDs, deduplicated and trimmed to the
    /// budget. Runs entirely as a background task.
    pub async fn warm_up(&self, markets: &[String], budget_per_market: usize) -> WarmupReport {
        let start = Instant::now();
        let mut total_preloaded = 0;
        info!(markets = markets.len(), budget_per_market, "cache warm-up starting");

        for market in markets {
            let mut load_set = self.popular_products(market, budget_per_market / 2).await;
            load_set.extend(self.frequently_accessed(budget_per_market / 4));
            load_set.extend(self.trending(budget_per_market / 4));
            load_set.extend(self.popular_category_products(budget_per_market / 4));

            let mut seen = std::collections::HashSet::new();
            load_set.retain(|id| seen.insert(id.clone()));
            load_set.truncate(budget_per_market);

            if load_set.is_empty() {
                warn!(market, "no products to warm up");
                continue;
            }
            self.preload(&load_set, 8).await;
            total_preloaded += load_set.len();
        }

        let report = WarmupReport {
            total_preloaded,
            markets_processed: markets.len(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(?report, "cache warm-up finished");
        report
    }

    /// One adaptive maintenance pass: invalidate products not accessed
    /// within the stale window, then refresh the trending set.
    pub async fn adaptive_management(&self) -> MaintenanceReport {
        let stale: Vec<String> = self
            .last_access
            .iter()
            .filter(|entry| entry.value().elapsed() > STALE_WINDOW)
            .map(|entry| entry.key().clone())
            .collect();

        if !stale.is_empty() {
            let cleaned = self.invalidate_many(&stale).await;
            for id in &stale {
                self.last_access.remove(id);
            }
            info!(cleaned, "stale products invalidated");
        }

        let trending = self.trending(50);
        if !trending.is_empty() {
            self.preload(&trending, 5).await;
        }

        MaintenanceReport {
            obsolete_cleaned: stale.len(),
            trending_preloaded: trending.len(),
        }
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn get_stats(&self) -> ProductCacheStats {
        let total = self.counters.total_requests.load(Ordering::Relaxed);
        let hits = self.counters.kv_hits.load(Ordering::Relaxed)
            + self.counters.local_hits.load(Ordering::Relaxed)
            + self.counters.remote_hits.load(Ordering::Relaxed);

        let mut top: Vec<(String, u64)> = self
            .access_frequency
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(10);

        let mut market_summary: HashMap<String, usize> = HashMap::new();
        for entry in self.market_popularity.iter() {
            *market_summary.entry(entry.key().0.clone()).or_insert(0) += 1;
        }

        ProductCacheStats {
            total_requests: total,
            kv_hits: self.counters.kv_hits.load(Ordering::Relaxed),
            kv_misses: self.counters.kv_misses.load(Ordering::Relaxed),
            local_catalog_hits: self.counters.local_hits.load(Ordering::Relaxed),
            remote_catalog_hits: self.counters.remote_hits.load(Ordering::Relaxed),
            minimal_products_served: self.counters.minimal_served.load(Ordering::Relaxed),
            total_failures: self.counters.total_failures.load(Ordering::Relaxed),
            hit_ratio: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            access_frequency_top10: top,
            category_stats: self
                .category_counts
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            market_popularity_summary: market_summary,
        }
    }
}

impl std::fmt::Debug for ProductCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductCache")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .field("minimal_products", &self.minimal_products)
            .finish()
    }
}

fn stable_hash(input: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish()
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use std::collections::BTreeMap;

    fn product(id: &str, category: &str) -> Product {
        Product {
            id: id.into(),
            title: format!("Product {id}"),
            description: "A test product".into(),
            price: 9.99,
            currency: "USD".into(),
            category: category.into(),
            image_urls: vec![format!("https://img.test/{id}.jpg")],
            metadata: BTreeMap::new(),
            is_minimal: false,
        }
    }

    fn cache_with_catalog() -> (Arc<InMemoryKvStore>, ProductCache) {
        let kv = Arc::new(InMemoryKvStore::new());
        let catalog = Arc::new(ContentEngine::new(vec![
            product("p1", "audio"),
            product("p2", "audio"),
            product("p3", "sports"),
        ]));
        let cache = ProductCache::new(
            kv.clone() as Arc<dyn KvStore>,
            Some(catalog),
            None,
            Duration::from_secs(3600),
            "product:",
        );
        (kv, cache)
    }

    #[tokio::test]
    async fn local_catalog_hit_writes_through_to_kv() {
        let (kv, cache) = cache_with_catalog();
        let found = cache.get_product("p1").await.unwrap();
        assert_eq!(found.id, "p1");

        // The record is now in the KV tier.
        let raw = kv.get("product:p1").await.unwrap();
        assert!(raw.is_some());

        let again = cache.get_product("p1").await.unwrap();
        assert_eq!(again, found);
        let stats = cache.get_stats();
        assert_eq!(stats.local_catalog_hits, 1);
        assert_eq!(stats.kv_hits, 1);
    }

    #[tokio::test]
    async fn miss_in_every_tier_returns_none_and_counts() {
        let (_kv, cache) = cache_with_catalog();
        assert!(cache.get_product("missing").await.is_none());
        assert_eq!(cache.get_stats().total_failures, 1);
    }

    #[tokio::test]
    async fn minimal_synthesis_when_enabled() {
        let (kv, cache) = cache_with_catalog();
        let cache = cache.with_minimal_products(true);
        let synthesized = cache.get_product("ghost").await.unwrap();
        assert!(synthesized.is_minimal);
        assert_eq!(cache.get_stats().total_failures, 0);
        // Written back with the short TTL.
        assert!(kv.get("product:ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remote_tier_is_consulted_after_local() {
        struct FixedRemote;
        #[async_trait]
        impl RemoteCatalog for FixedRemote {
            async fn fetch_product(&self, product_id: &str) -> Result<Option<Product>> {
                if product_id == "r1" {
                    Ok(Some(product("r1", "remote")))
                } else {
                    Ok(None)
                }
            }
        }

        let kv = Arc::new(InMemoryKvStore::new());
        let cache = ProductCache::new(
            kv as Arc<dyn KvStore>,
            None,
            Some(Arc::new(FixedRemote)),
            Duration::from_secs(60),
            "product:",
        );
        assert!(cache.get_product("r1").await.is_some());
        assert!(cache.get_product("r2").await.is_none());
        let stats = cache.get_stats();
        assert_eq!(stats.remote_catalog_hits, 1);
        assert_eq!(stats.total_failures, 1);
    }

    #[tokio::test]
    async fn preload_touches_every_product() {
        let (kv, cache) = cache_with_catalog();
        cache
            .preload(&["p1".to_string(), "p2".to_string(), "p3".to_string()], 2)
            .await;
        for id in ["p1", "p2", "p3"] {
            assert!(kv.get(&format!("product:{id}")).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn telemetry_feeds_warmup_sources() {
        let (_kv, cache) = cache_with_catalog();
        for _ in 0..3 {
            let _ = cache.get_product_in_market("p1", Some("US")).await;
        }
        let _ = cache.get_product_in_market("p2", Some("US")).await;

        assert_eq!(cache.frequently_accessed(1), vec!["p1".to_string()]);
        let popular = cache.popular_products("US", 2).await;
        assert_eq!(popular[0], "p1");
        let trending = cache.trending(10);
        assert!(trending.contains(&"p1".to_string()));
        let by_category = cache.popular_category_products(2);
        assert!(!by_category.is_empty());
    }

    #[tokio::test]
    async fn popular_products_fall_back_to_catalog() {
        let (_kv, cache) = cache_with_catalog();
        // No telemetry, nothing cached: deterministic catalog sample.
        let first = cache.popular_products("US", 2).await;
        let second = cache.popular_products("US", 2).await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn warm_up_reports_preloaded_products() {
        let (kv, cache) = cache_with_catalog();
        let report = cache.warm_up(&["US".to_string()], 10).await;
        assert!(report.total_preloaded >= 3);
        assert_eq!(report.markets_processed, 1);
        assert!(kv.get("product:p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cached_ids_strip_prefix() {
        let (_kv, cache) = cache_with_catalog();
        let _ = cache.get_product("p1").await;
        let _ = cache.get_product("p2").await;
        let mut ids = cache.cached_product_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn adaptive_management_keeps_fresh_products() {
        let (kv, cache) = cache_with_catalog();
        let _ = cache.get_product("p1").await;
        let report = cache.adaptive_management().await;
        // Freshly accessed, so nothing is stale.
        assert_eq!(report.obsolete_cleaned, 0);
        assert!(kv.get("product:p1").await.unwrap().is_some());
    }
}
