//! Redis implementation of the MerchFlow KV store
//!
//! Wraps `redis::aio::ConnectionManager` behind the core's
//! [`KvStore`] trait. Every operation runs under the configured
//! per-operation timeout and collapses any driver error into the single
//! `KvUnavailable` kind, so callers never see connection-specific
//! failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use merchflow::Settings;
//! use merchflow_redis::RedisKvStore;
//!
//! async fn example() -> merchflow::Result<()> {
//!     let settings = Settings::from_env();
//!     let store = RedisKvStore::connect(&settings).await?;
//!     store.set("greeting", "hello", None).await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use merchflow::error::{Error, Result};
use merchflow::kv::{KvHealth, KvOpCounters, KvStats, KvStore, DEFAULT_TTL};
use merchflow::types::HealthStatus;
use merchflow::Settings;

/// Redis-backed `KvStore`.
///
/// Connections are pooled and reconnected by the driver's connection
/// manager; the adapter adds bounded timeouts and health probing on top.
pub struct RedisKvStore {
    manager: ConnectionManager,
    op_timeout: Duration,
    counters: KvOpCounters,
}

impl RedisKvStore {
    /// Connect using the settings' KV section (URL, auth, timeouts).
    ///
    /// `Settings::kv_max_conns` is not consumed here: the connection
    /// manager multiplexes a single reconnecting connection and exposes no
    /// pool-size knob.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        Self::connect_url(
            &settings.kv_url(),
            settings.kv_connect_timeout,
            settings.kv_op_timeout,
        )
        .await
    }

    /// Connect to an explicit URL with explicit timeouts.
    pub async fn connect_url(
        url: &str,
        connect_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self> {
        info!(%url, "connecting to Redis");
        let client = redis::Client::open(url).map_err(|e| {
            error!(%e, "failed to create Redis client");
            Error::KvUnavailable(format!("client: {e}"))
        })?;

        let manager = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                error!("Redis connect timed out");
                Error::KvUnavailable("connect timeout".to_string())
            })?
            .map_err(|e| {
                error!(%e, "failed to connect to Redis");
                Error::KvUnavailable(format!("connect: {e}"))
            })?;

        debug!("Redis connection established");
        Ok(Self {
            manager,
            op_timeout,
            counters: KvOpCounters::default(),
        })
    }

    /// Run a driver call under the per-operation timeout.
    async fn bounded<T, F>(&self, op_name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.counters.record_err();
                warn!(op = op_name, %err, "Redis operation failed");
                Err(Error::KvUnavailable(format!("{op_name}: {err}")))
            }
            Err(_) => {
                self.counters.record_err();
                warn!(op = op_name, timeout_ms = self.op_timeout.as_millis() as u64, "Redis operation timed out");
                Err(Error::KvUnavailable(format!("{op_name}: timeout")))
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        let value: Option<String> = self
            .bounded("GET", async move { conn.get(&key).await })
            .await?;
        self.counters.record_get(value.is_some());
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<String>> = self
            .bounded("MGET", async move {
                cmd.query_async::<Vec<Option<String>>>(&mut conn).await
            })
            .await?;
        for value in &values {
            self.counters.record_get(value.is_some());
        }
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        let value = value.to_string();
        let ttl = ttl.unwrap_or(DEFAULT_TTL);
        self.bounded("SETEX", async move {
            conn.set_ex::<_, _, ()>(&key, &value, ttl.as_secs().max(1)).await
        })
        .await?;
        self.counters.record_ok();
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let keys = keys.to_vec();
        let removed: u64 = self
            .bounded("DEL", async move { conn.del(&keys).await })
            .await?;
        self.counters.record_ok();
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = pattern.to_string();
        let mut keys: Vec<String> = self
            .bounded("KEYS", async move { conn.keys(&pattern).await })
            .await?;
        keys.sort();
        self.counters.record_ok();
        Ok(keys)
    }

    async fn ping(&self) -> Result<Duration> {
        let mut conn = self.manager.clone();
        let start = Instant::now();
        self.bounded("PING", async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await?;
        Ok(start.elapsed())
    }

    async fn info(&self) -> Result<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        let raw: String = self
            .bounded("INFO", async move {
                redis::cmd("INFO").query_async::<String>(&mut conn).await
            })
            .await?;
        Ok(parse_info(&raw))
    }

    async fn health_check(&self) -> KvHealth {
        match self.ping().await {
            Ok(latency) => KvHealth {
                status: HealthStatus::Healthy,
                connected: true,
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
                last_test: "successful".to_string(),
            },
            Err(err) => KvHealth {
                status: HealthStatus::Unhealthy,
                connected: false,
                latency_ms: None,
                last_test: format!("failed: {err}"),
            },
        }
    }

    fn stats(&self) -> KvStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore")
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

/// Flatten `INFO` output into a key/value map; section headers become a
/// prefix-free namespace the way the dashboard expects.
fn parse_info(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
