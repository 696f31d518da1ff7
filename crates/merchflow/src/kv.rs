// Copyright 2026 MerchFlow Contributors

//! Key-value store abstraction
//!
//! The core treats its backing store as an opaque, TTL-aware string KV with
//! a handful of operations: `get`, `set`, `delete`, `keys`, `ping`, `info`.
//! The live Redis implementation lives in the `merchflow-redis` crate;
//! [`InMemoryKvStore`] is the in-process twin used as the factory's
//! degraded-mode fallback and as the test double.
//!
//! Failure semantics: every operation fails with the single
//! [`Error::KvUnavailable`] kind. Callers never see driver-specific errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::HealthStatus;

/// Upper bound applied when a caller sets a key without an explicit TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// Result of a KV health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvHealth {
    /// Probe verdict.
    pub status: HealthStatus,
    /// Whether a connection is currently established.
    pub connected: bool,
    /// Round-trip latency of the probe ping, when one succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Human-readable outcome of the last probe.
    pub last_test: String,
}

/// Snapshot of a store's operation counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvStats {
    /// Total operations attempted.
    pub operations_total: u64,
    /// Operations that completed successfully.
    pub operations_successful: u64,
    /// Operations that failed.
    pub operations_failed: u64,
    /// GETs that found a value.
    pub cache_hits: u64,
    /// GETs that found nothing.
    pub cache_misses: u64,
    /// Hit ratio over all GETs.
    pub hit_ratio: f64,
}

/// Shared operation counters for `KvStore` implementations.
#[derive(Debug, Default)]
pub struct KvOpCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl KvOpCounters {
    /// Record a successful non-GET operation.
    pub fn record_ok(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed operation.
    pub fn record_err(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a GET outcome.
    pub fn record_get(&self, hit: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> KvStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        KvStats {
            operations_total: self.total.load(Ordering::Relaxed),
            operations_successful: self.successful.load(Ordering::Relaxed),
            operations_failed: self.failed.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            hit_ratio: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

/// Typed interface over an external TTL-aware string KV store.
///
/// Keys are opaque strings; values are UTF-8 text. A `set` without a TTL is
/// bounded by [`DEFAULT_TTL`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Fetch several values in one round trip where the backend supports
    /// it. The default implementation loops over [`KvStore::get`].
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Store a value. `ttl` of `None` applies the bounded default.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// List keys matching a glob pattern (`*` wildcards only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Round-trip probe.
    async fn ping(&self) -> Result<Duration>;

    /// Backend diagnostics as a flat string map.
    async fn info(&self) -> Result<HashMap<String, String>>;

    /// Probe the store and report structured health.
    async fn health_check(&self) -> KvHealth;

    /// Operation counters.
    fn stats(&self) -> KvStats;
}

/// Fetch and deserialize a JSON value.
pub async fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON value.
pub async fn set_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<bool> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// In-process `KvStore` twin.
///
/// TTL-respecting and pattern-aware, it stands in for the live store in
/// tests and serves as the factory's fallback instance when the real store
/// is unreachable, so the rest of the core keeps one code path.
#[derive(Default)]
pub struct InMemoryKvStore {
    table: RwLock<HashMap<String, StoredValue>>,
    counters: KvOpCounters,
}

impl InMemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.table.read().values().filter(|v| v.expires_at > now).count()
    }

    /// Whether the store holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Called opportunistically from mutating ops.
    fn purge_expired(table: &mut HashMap<String, StoredValue>) {
        let now = Instant::now();
        table.retain(|_, v| v.expires_at > now);
    }
}

impl std::fmt::Debug for InMemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKvStore")
            .field("keys", &self.table.read().len())
            .finish()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let table = self.table.read();
        let value = table
            .get(key)
            .filter(|v| v.expires_at > Instant::now())
            .map(|v| v.value.clone());
        self.counters.record_get(value.is_some());
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let ttl = ttl.unwrap_or(DEFAULT_TTL).min(DEFAULT_TTL);
        let mut table = self.table.write();
        Self::purge_expired(&mut table);
        table.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.counters.record_ok();
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut table = self.table.write();
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some(stored) = table.remove(key) {
                if stored.expires_at > now {
                    removed += 1;
                }
            }
        }
        self.counters.record_ok();
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let table = self.table.read();
        let now = Instant::now();
        let mut matched: Vec<String> = table
            .iter()
            .filter(|(_, v)| v.expires_at > now)
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        matched.sort();
        self.counters.record_ok();
        Ok(matched)
    }

    async fn ping(&self) -> Result<Duration> {
        Ok(Duration::from_micros(1))
    }

    async fn info(&self) -> Result<HashMap<String, String>> {
        let mut info = HashMap::new();
        info.insert("backend".to_string(), "memory".to_string());
        info.insert("keys".to_string(), self.len().to_string());
        Ok(info)
    }

    async fn health_check(&self) -> KvHealth {
        KvHealth {
            status: HealthStatus::Healthy,
            connected: true,
            latency_ms: Some(0.0),
            last_test: "successful".to_string(),
        }
    }

    fn stats(&self) -> KvStats {
        self.counters.snapshot()
    }
}

/// Match a key against a glob pattern where `*` matches any run of
/// characters. This is the only wildcard the core uses.
#[must_use]
pub fn glob_match(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut remainder = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            // Anchored prefix
            match remainder.strip_prefix(part) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if i == parts.len() - 1 && !pattern.ends_with('*') {
            // Anchored suffix
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(pos) => remainder = &remainder[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Map an infrastructure error into the single KV failure kind.
#[must_use]
pub fn kv_unavailable(context: &str, detail: impl std::fmt::Display) -> Error {
    Error::KvUnavailable(format!("{context}: {detail}"))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_round_trip() {
        let store = InMemoryKvStore::new();
        store.set("k1", "v1", None).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some("v1".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_keys_are_invisible() {
        let store = InMemoryKvStore::new();
        store
            .set("gone", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert!(store.keys("gone*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_returns_live_keys_under_prefix() {
        let store = InMemoryKvStore::new();
        store.set("product:1", "a", None).await.unwrap();
        store.set("product:2", "b", None).await.unwrap();
        store.set("event:1", "c", None).await.unwrap();
        store
            .set("product:expired", "d", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let keys = store.keys("product:*").await.unwrap();
        assert_eq!(keys, vec!["product:1".to_string(), "product:2".to_string()]);
    }

    #[tokio::test]
    async fn delete_returns_live_count() {
        let store = InMemoryKvStore::new();
        store.set("a", "1", None).await.unwrap();
        store.set("b", "2", None).await.unwrap();
        let removed = store
            .delete(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let store = InMemoryKvStore::new();
        let value = vec!["x".to_string(), "y".to_string()];
        set_json(&store, "list", &value, None).await.unwrap();
        let back: Option<Vec<String>> = get_json(&store, "list").await.unwrap();
        assert_eq!(back, Some(value));
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let store = InMemoryKvStore::new();
        store.set("k", "v", None).await.unwrap();
        let _ = store.get("k").await.unwrap();
        let _ = store.get("nope").await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("product:*", "product:123"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("diversity_cache_v2:u1:*", "diversity_cache_v2:u1:abc"));
        assert!(!glob_match("diversity_cache_v2:u1:*", "diversity_cache_v2:u2:abc"));
        assert!(glob_match("a*c", "abc"));
        assert!(!glob_match("a*c", "abd"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }
}
