//! Lazy singleton wiring for the MerchFlow core
//!
//! The [`ServiceFactory`] owns one instance of every core service and
//! builds each lazily on first request, behind a per-service async lock
//! with double-checked initialization. The KV store additionally sits
//! behind a small circuit guard: after repeated connect failures the
//! factory stops attempting connections for a cooldown and hands out the
//! in-memory fallback store instead, so callers never block on a dead
//! backend.
//!
//! Composite getters auto-wire their dependencies by calling the factory
//! recursively; explicit `install_*` overrides win over auto-wiring. The
//! factory also owns the background-task plane (event flush, event
//! recovery, cache maintenance) and tears it down on `shutdown()`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use merchflow::collaborative::{
    CollaborativeEngine, RemoteCollaborativeClient, StaticCollaborativeEngine,
};
use merchflow::content::ContentEngine;
use merchflow::diversity_cache::DiversityAwareCache;
use merchflow::events::{EventStore, EventStoreConfig};
use merchflow::hybrid::HybridRecommender;
use merchflow::intent::CategoryKeywords;
use merchflow::kv::{InMemoryKvStore, KvStore};
use merchflow::orchestrator::{RecommendationOrchestrator, TemplateResponseGenerator};
use merchflow::product_cache::ProductCache;
use merchflow::types::Product;
use merchflow::Settings;
use merchflow_redis::RedisKvStore;

/// Connect failures that open the factory's KV circuit.
const KV_CIRCUIT_THRESHOLD: u32 = 5;

/// Time the KV circuit stays open before another connect attempt.
const KV_CIRCUIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Health-probe timeout applied right after a successful connect.
const KV_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Drain deadline applied to each background task on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Cadence of the product-cache maintenance task.
const CACHE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(900);

#[derive(Debug, Default)]
struct KvCircuit {
    failures: u32,
    last_failure: Option<Instant>,
    open: bool,
}

impl KvCircuit {
    /// Whether connects should be skipped right now.
    fn is_open(&mut self) -> bool {
        if self.failures < KV_CIRCUIT_THRESHOLD {
            return false;
        }
        if let Some(last) = self.last_failure {
            if last.elapsed() > KV_CIRCUIT_COOLDOWN {
                self.open = false;
                self.failures = 0;
                return false;
            }
        }
        self.open
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        if self.failures >= KV_CIRCUIT_THRESHOLD {
            self.open = true;
            warn!(failures = self.failures, "factory KV circuit opened");
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct Slot<T: ?Sized> {
    instance: SyncMutex<Option<Arc<T>>>,
    init: Mutex<()>,
}

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self {
            instance: SyncMutex::new(None),
            init: Mutex::new(()),
        }
    }
}

impl<T: ?Sized> Slot<T> {
    fn get(&self) -> Option<Arc<T>> {
        self.instance.lock().clone()
    }

    fn set(&self, value: Arc<T>) {
        *self.instance.lock() = Some(value);
    }

    fn clear(&self) {
        *self.instance.lock() = None;
    }
}

/// Process-wide registry of lazily-built singletons.
pub struct ServiceFactory {
    settings: Settings,
    catalog: Vec<Product>,

    kv: Slot<dyn KvStore>,
    content: Slot<ContentEngine>,
    collaborative: Slot<dyn CollaborativeEngine>,
    product_cache: Slot<ProductCache>,
    diversity_cache: Slot<DiversityAwareCache>,
    event_store: Slot<EventStore>,
    recommender: Slot<HybridRecommender>,
    orchestrator: Slot<RecommendationOrchestrator>,

    kv_circuit: SyncMutex<KvCircuit>,
    kv_fallback: SyncMutex<Option<Arc<dyn KvStore>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServiceFactory {
    /// Create a factory over the given settings with an empty catalog.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings,
            catalog: Vec::new(),
            kv: Slot::default(),
            content: Slot::default(),
            collaborative: Slot::default(),
            product_cache: Slot::default(),
            diversity_cache: Slot::default(),
            event_store: Slot::default(),
            recommender: Slot::default(),
            orchestrator: Slot::default(),
            kv_circuit: SyncMutex::new(KvCircuit::default()),
            kv_fallback: SyncMutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Provide the local product catalog the content engine is built from.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Vec<Product>) -> Self {
        self.catalog = catalog;
        self
    }

    /// The settings this factory was built with.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ========================================================================
    // Overrides
    // ========================================================================

    /// Install an explicit KV store, bypassing the connect path.
    pub fn install_kv(&self, kv: Arc<dyn KvStore>) {
        self.kv.set(kv);
    }

    /// Install an explicit collaborative engine.
    pub fn install_collaborative(&self, engine: Arc<dyn CollaborativeEngine>) {
        self.collaborative.set(engine);
    }

    /// Install an explicit event store.
    pub fn install_event_store(&self, store: Arc<EventStore>) {
        self.event_store.set(store);
    }

    // ========================================================================
    // Leaf services
    // ========================================================================

    /// The KV store singleton.
    ///
    /// Circuit-guarded: while the circuit is open the shared in-memory
    /// fallback is served without attempting a connection. A failed connect
    /// earns exactly one fast retry at 0.8x the timeout before the failure
    /// is recorded against the circuit.
    pub async fn kv_store(&self) -> Arc<dyn KvStore> {
        if self.kv_circuit.lock().is_open() {
            warn!("KV circuit open, serving fallback store");
            return self.fallback_kv();
        }
        if let Some(kv) = self.kv.get() {
            return kv;
        }

        let _guard = self.kv.init.lock().await;
        if let Some(kv) = self.kv.get() {
            return kv;
        }

        if !self.settings.kv_enabled {
            info!("KV disabled, using in-memory store");
            let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
            self.kv.set(Arc::clone(&kv));
            return kv;
        }

        let connect_timeout = self.settings.kv_connect_timeout;
        match self.try_connect(connect_timeout).await {
            Ok(kv) => {
                self.kv_circuit.lock().reset();
                self.kv.set(Arc::clone(&kv));
                info!("KV store singleton initialized");
                kv
            }
            Err(first_err) => {
                // One fast retry at a reduced deadline, then give up.
                let retry_timeout = connect_timeout.mul_f64(0.8);
                warn!(%first_err, retry_ms = retry_timeout.as_millis() as u64, "KV connect failed, fast retry");
                match self.try_connect(retry_timeout).await {
                    Ok(kv) => {
                        self.kv_circuit.lock().reset();
                        self.kv.set(Arc::clone(&kv));
                        kv
                    }
                    Err(retry_err) => {
                        // Serve the shared fallback but leave the slot
                        // empty: the next call attempts a fresh connect
                        // until the circuit opens.
                        error!(%retry_err, "KV connect retry failed, serving fallback");
                        self.kv_circuit.lock().record_failure();
                        self.fallback_kv()
                    }
                }
            }
        }
    }

    async fn try_connect(&self, timeout: Duration) -> merchflow::Result<Arc<dyn KvStore>> {
        let store = tokio::time::timeout(
            timeout,
            RedisKvStore::connect_url(
                &self.settings.kv_url(),
                timeout,
                self.settings.kv_op_timeout,
            ),
        )
        .await
        .map_err(|_| merchflow::Error::KvUnavailable("connect timeout".into()))??;

        // Quick health probe; a slow probe is tolerated, a failed one is not.
        match tokio::time::timeout(KV_HEALTH_TIMEOUT, store.ping()).await {
            Ok(Ok(latency)) => {
                info!(latency_ms = latency.as_secs_f64() * 1000.0, "KV health probe ok");
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => warn!("KV health probe timed out, using connection anyway"),
        }
        Ok(Arc::new(store))
    }

    /// The shared degraded-mode store, created on first use so every
    /// degraded caller sees the same data.
    fn fallback_kv(&self) -> Arc<dyn KvStore> {
        let mut fallback = self.kv_fallback.lock();
        Arc::clone(fallback.get_or_insert_with(|| Arc::new(InMemoryKvStore::new())))
    }

    /// The content engine singleton, built from the provided catalog.
    pub async fn content_engine(&self) -> Arc<ContentEngine> {
        if let Some(engine) = self.content.get() {
            return engine;
        }
        let _guard = self.content.init.lock().await;
        if let Some(engine) = self.content.get() {
            return engine;
        }
        let engine = Arc::new(ContentEngine::new(self.catalog.clone()));
        self.content.set(Arc::clone(&engine));
        engine
    }

    /// The collaborative engine singleton: the remote client when a URL is
    /// configured, else an inert in-process stand-in.
    pub async fn collaborative_engine(&self) -> Arc<dyn CollaborativeEngine> {
        if let Some(engine) = self.collaborative.get() {
            return engine;
        }
        let _guard = self.collaborative.init.lock().await;
        if let Some(engine) = self.collaborative.get() {
            return engine;
        }
        let engine: Arc<dyn CollaborativeEngine> = match &self.settings.collaborative_url {
            Some(url) => match RemoteCollaborativeClient::new(url.clone()) {
                Ok(client) => Arc::new(client),
                Err(err) => {
                    warn!(%err, "remote collaborative client unavailable, using inert engine");
                    Arc::new(StaticCollaborativeEngine::empty())
                }
            },
            None => Arc::new(StaticCollaborativeEngine::empty()),
        };
        self.collaborative.set(Arc::clone(&engine));
        engine
    }

    // ========================================================================
    // Composite services
    // ========================================================================

    /// The product cache singleton (KV + content engine tiers).
    pub async fn product_cache(&self) -> Arc<ProductCache> {
        if let Some(cache) = self.product_cache.get() {
            return cache;
        }
        let kv = self.kv_store().await;
        let content = self.content_engine().await;

        let _guard = self.product_cache.init.lock().await;
        if let Some(cache) = self.product_cache.get() {
            return cache;
        }
        let cache = Arc::new(
            ProductCache::new(
                kv,
                Some(content),
                None,
                self.settings.cache_ttl,
                self.settings.cache_prefix.clone(),
            )
            .with_minimal_products(self.settings.enable_minimal_products),
        );
        self.product_cache.set(Arc::clone(&cache));
        cache
    }

    /// The diversity cache singleton. The intent vocabulary comes from the
    /// catalog when one is loaded, else the built-in fallback set.
    pub async fn diversity_cache(&self) -> Arc<DiversityAwareCache> {
        if let Some(cache) = self.diversity_cache.get() {
            return cache;
        }
        let kv = self.kv_store().await;
        let categories = self.intent_vocabulary().await;

        let _guard = self.diversity_cache.init.lock().await;
        if let Some(cache) = self.diversity_cache.get() {
            return cache;
        }
        let cache = Arc::new(DiversityAwareCache::new(kv, categories));
        self.diversity_cache.set(Arc::clone(&cache));
        cache
    }

    async fn intent_vocabulary(&self) -> CategoryKeywords {
        let content = self.content_engine().await;
        if content.is_loaded() {
            content.category_keywords()
        } else {
            CategoryKeywords::builtin()
        }
    }

    /// The event store singleton.
    pub async fn event_store(&self) -> Arc<EventStore> {
        if let Some(store) = self.event_store.get() {
            return store;
        }
        let kv = self.kv_store().await;

        let _guard = self.event_store.init.lock().await;
        if let Some(store) = self.event_store.get() {
            return store;
        }
        let store = Arc::new(EventStore::new(
            kv,
            EventStoreConfig {
                cache_ttl: self.settings.event_cache_ttl,
                buffer_size: self.settings.event_buffer_size,
                flush_interval: self.settings.event_flush_interval,
                fallback_dir: self.settings.event_fallback_dir.clone(),
            },
        ));
        self.event_store.set(Arc::clone(&store));
        store
    }

    /// The hybrid recommender singleton, fully auto-wired.
    pub async fn hybrid_recommender(&self) -> Arc<HybridRecommender> {
        if let Some(recommender) = self.recommender.get() {
            return recommender;
        }
        let content = self.content_engine().await;
        let collaborative = self.collaborative_engine().await;
        let event_store = self.event_store().await;
        let product_cache = self.product_cache().await;

        let _guard = self.recommender.init.lock().await;
        if let Some(recommender) = self.recommender.get() {
            return recommender;
        }
        let recommender = Arc::new(
            HybridRecommender::new(content, collaborative, self.settings.content_weight)
                .with_event_store(event_store)
                .with_product_cache(product_cache)
                .with_exclude_seen(self.settings.exclude_seen),
        );
        self.recommender.set(Arc::clone(&recommender));
        recommender
    }

    /// The orchestrator singleton, fully auto-wired, with the templated
    /// response generator.
    pub async fn orchestrator(&self) -> Arc<RecommendationOrchestrator> {
        if let Some(orchestrator) = self.orchestrator.get() {
            return orchestrator;
        }
        let diversity_cache = self.diversity_cache().await;
        let recommender = self.hybrid_recommender().await;
        let event_store = self.event_store().await;
        let product_cache = self.product_cache().await;
        let kv = self.kv_store().await;
        let categories = self.intent_vocabulary().await;

        let _guard = self.orchestrator.init.lock().await;
        if let Some(orchestrator) = self.orchestrator.get() {
            return orchestrator;
        }
        let orchestrator = Arc::new(
            RecommendationOrchestrator::new(diversity_cache, recommender, kv, categories)
                .with_event_store(event_store)
                .with_product_cache(product_cache)
                .with_response_generator(Arc::new(TemplateResponseGenerator)),
        );
        self.orchestrator.set(Arc::clone(&orchestrator));
        orchestrator
    }

    // ========================================================================
    // Background-task plane
    // ========================================================================

    /// Spawn the background tasks: event flush, event recovery, and (when
    /// enabled) product-cache maintenance. Idempotence is the caller's
    /// concern; call once at startup.
    pub async fn start_background_tasks(&self) {
        let event_store = self.event_store().await;
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(
            Arc::clone(&event_store).run_flush_loop(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&event_store).run_recovery_loop(self.shutdown_tx.subscribe()),
        ));

        if self.settings.cache_background_tasks {
            let cache = self.product_cache().await;
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CACHE_MAINTENANCE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = cache.adaptive_management().await;
                            tracing::debug!(?report, "cache maintenance pass");
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }
        info!(tasks = tasks.len(), "background tasks started");
    }

    /// Signal shutdown, drain background tasks, run the event store's final
    /// flush, and reset every instance and the KV circuit.
    pub async fn shutdown(&self) {
        info!("factory shutdown starting");
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_DRAIN, task).await.is_err() {
                warn!("background task did not drain in time, aborting");
            }
        }
        drop(tasks);

        if let Some(store) = self.event_store.get() {
            store.close().await;
        }

        self.kv.clear();
        self.content.clear();
        self.collaborative.clear();
        self.product_cache.clear();
        self.diversity_cache.clear();
        self.event_store.clear();
        self.recommender.clear();
        self.orchestrator.clear();
        self.kv_circuit.lock().reset();
        *self.kv_fallback.lock() = None;
        let _ = self.shutdown_tx.send(false);
        info!("factory shutdown complete");
    }

    /// Current KV-circuit observability tuple: (failures, open).
    #[must_use]
    pub fn kv_circuit_state(&self) -> (u32, bool) {
        let circuit = self.kv_circuit.lock();
        (circuit.failures, circuit.open)
    }
}

impl std::fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFactory")
            .field("kv_enabled", &self.settings.kv_enabled)
            .field("catalog", &self.catalog.len())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[tokio::test]
    async fn kv_disabled_yields_memory_store() {
        let factory = ServiceFactory::new(settings());
        let kv = factory.kv_store().await;
        assert!(kv.health_check().await.connected);
        assert_eq!(factory.kv_circuit_state(), (0, false));
    }

    #[tokio::test]
    async fn singletons_are_shared() {
        let factory = ServiceFactory::new(settings());
        let a = factory.event_store().await;
        let b = factory.event_store().await;
        assert!(Arc::ptr_eq(&a, &b));

        let r1 = factory.hybrid_recommender().await;
        let r2 = factory.hybrid_recommender().await;
        assert!(Arc::ptr_eq(&r1, &r2));
    }

    #[tokio::test]
    async fn concurrent_first_calls_share_one_instance() {
        let factory = Arc::new(ServiceFactory::new(settings()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let factory = Arc::clone(&factory);
            handles.push(tokio::spawn(async move { factory.event_store().await }));
        }
        let mut stores = Vec::new();
        for handle in handles {
            stores.push(handle.await.unwrap());
        }
        for store in &stores[1..] {
            assert!(Arc::ptr_eq(&stores[0], store));
        }
    }

    #[tokio::test]
    async fn failing_kv_opens_circuit_after_threshold() {
        let mut settings = settings();
        settings.kv_enabled = true;
        settings.kv_host = "127.0.0.1".into();
        settings.kv_port = 1; // nothing listens here
        settings.kv_connect_timeout = Duration::from_millis(100);

        let factory = ServiceFactory::new(settings);
        for attempt in 1..=5u32 {
            let kv = factory.kv_store().await;
            // The fallback store still works.
            assert!(kv.set("k", "v", None).await.unwrap());
            assert_eq!(factory.kv_circuit_state().0, attempt);
        }
        assert_eq!(factory.kv_circuit_state(), (5, true));

        // With the circuit open the next call skips the connect entirely.
        let start = std::time::Instant::now();
        let _ = factory.kv_store().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn overrides_win_over_autowiring() {
        let factory = ServiceFactory::new(settings());
        let custom: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        factory.install_kv(Arc::clone(&custom));
        let resolved = factory.kv_store().await;
        assert!(Arc::ptr_eq(&custom, &resolved));
    }

    #[tokio::test]
    async fn shutdown_resets_instances() {
        let factory = ServiceFactory::new(settings());
        let before = factory.event_store().await;
        factory.start_background_tasks().await;
        factory.shutdown().await;
        let after = factory.event_store().await;
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
