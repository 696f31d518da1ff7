// Copyright 2026 MerchFlow Contributors

//! The resilient event store
//!
//! Write path: validate, buffer, bulk-flush behind the write breaker, spill
//! to the on-disk journal when the store is down. Read path: in-memory
//! profile cache, then KV, then materialization, behind the read breaker
//! with stale-cache / empty-profile fallbacks. Two background loops (flush
//! and recovery) are spawned by the factory and react to a shutdown signal.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use crate::error::{Error, Result};
use crate::kv::{self, KvStore};
use crate::types::{EventType, HealthStatus, UserEvent, UserProfile};

use super::profile::build_profile;
use super::schema::{create_event_id, validate_event_data};

/// Retention applied to events and per-user index lists.
const EVENT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Retention applied to materialized profiles in the KV tier.
const PROFILE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Per-user index list cap.
const MAX_EVENTS_PER_USER: usize = 1000;

/// Events retried from the failed buffer per recovery tick.
const RECOVERY_BATCH: usize = 50;

/// Journal files replayed per recovery tick.
const RECOVERY_FILES_PER_TICK: usize = 3;

/// Cadence of the recovery loop.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Event store tunables.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// In-memory profile cache TTL.
    pub cache_ttl: Duration,
    /// Buffer length that triggers a bulk flush.
    pub buffer_size: usize,
    /// Maximum time between flushes.
    pub flush_interval: Duration,
    /// On-disk journal directory; journaling is disabled when unset.
    pub fallback_dir: Option<PathBuf>,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            buffer_size: 200,
            flush_interval: Duration::from_secs(30),
            fallback_dir: None,
        }
    }
}

/// Counter snapshot exposed by [`EventStore::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreMetrics {
    /// Events persisted to the KV store.
    pub events_stored: u64,
    /// Events accepted into the buffer.
    pub events_buffered: u64,
    /// Events rejected by schema validation.
    pub events_failed: u64,
    /// Profiles materialized from the event log.
    pub profiles_generated: u64,
    /// Profile reads served from the in-memory cache.
    pub cache_hits: u64,
    /// Profile reads that missed the in-memory cache.
    pub cache_misses: u64,
    /// Read-path errors.
    pub read_errors: u64,
    /// Write-path errors.
    pub write_errors: u64,
    /// Bulk persists executed.
    pub bulk_operations: u64,
    /// Times a fallback path served a result.
    pub fallbacks_used: u64,
    /// Times a circuit breaker rejected an operation.
    pub circuit_breaker_triggers: u64,
    /// Successful recovery passes.
    pub recovery_operations: u64,
    /// Journal files written.
    pub local_storage_operations: u64,
    /// Exponentially-decayed KV latency.
    pub kv_latency_ms: f64,
    /// Current pending buffer length.
    pub pending_buffer_size: usize,
    /// Current failed buffer length.
    pub failed_buffer_size: usize,
    /// Profiles currently cached in memory.
    pub profile_cache_size: usize,
    /// Read breaker snapshot.
    pub read_circuit_breaker: CircuitBreakerStats,
    /// Write breaker snapshot.
    pub write_circuit_breaker: CircuitBreakerStats,
}

/// Optional per-event attributes.
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    /// Session the event occurred in.
    pub session_id: Option<String>,
    /// Market the event occurred in.
    pub market_id: Option<String>,
    /// Request origin IP.
    pub ip_address: Option<String>,
    /// Request user agent.
    pub user_agent: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    events_stored: AtomicU64,
    events_buffered: AtomicU64,
    events_failed: AtomicU64,
    profiles_generated: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    bulk_operations: AtomicU64,
    fallbacks_used: AtomicU64,
    circuit_breaker_triggers: AtomicU64,
    recovery_operations: AtomicU64,
    local_storage_operations: AtomicU64,
}

#[derive(Debug)]
struct Buffers {
    pending: Vec<UserEvent>,
    failed: Vec<UserEvent>,
    last_flush: Instant,
}

#[derive(Debug, Clone)]
struct CachedProfile {
    profile: UserProfile,
    cached_at: Instant,
    needs_refresh: bool,
}

/// Journal file payload: a batch of events plus the spill timestamp.
#[derive(Debug, Serialize, Deserialize)]
struct JournalBatch {
    events: Vec<UserEvent>,
    timestamp: i64,
}

/// The resilient append-only user event store.
pub struct EventStore {
    kv: Arc<dyn KvStore>,
    config: EventStoreConfig,
    buffers: Mutex<Buffers>,
    profile_cache: DashMap<String, CachedProfile>,
    read_breaker: CircuitBreaker,
    write_breaker: CircuitBreaker,
    counters: Counters,
    kv_latency_ms: SyncMutex<f64>,
}

impl EventStore {
    /// Create a store over the given KV with the given tunables.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, config: EventStoreConfig) -> Self {
        if let Some(dir) = &config.fallback_dir {
            if let Err(err) = std::fs::create_dir_all(dir) {
                warn!(?dir, %err, "could not create fallback journal directory");
            }
        }
        info!(
            buffer_size = config.buffer_size,
            flush_interval_s = config.flush_interval.as_secs(),
            journal = config.fallback_dir.is_some(),
            "event store initialized"
        );
        Self {
            kv,
            config,
            buffers: Mutex::new(Buffers {
                pending: Vec::new(),
                failed: Vec::new(),
                last_flush: Instant::now(),
            }),
            profile_cache: DashMap::new(),
            read_breaker: CircuitBreaker::new(
                "event_store_read",
                CircuitBreakerConfig {
                    failure_threshold: 3,
                    cooldown: Duration::from_secs(30),
                    success_threshold: 2,
                    max_op_timeout: Duration::from_secs(10),
                },
            ),
            write_breaker: CircuitBreaker::new(
                "event_store_write",
                CircuitBreakerConfig {
                    failure_threshold: 5,
                    cooldown: Duration::from_secs(20),
                    success_threshold: 3,
                    max_op_timeout: Duration::from_secs(15),
                },
            ),
            counters: Counters::default(),
            kv_latency_ms: SyncMutex::new(0.0),
        }
    }

    fn event_key(event_id: &str) -> String {
        format!("event:{event_id}")
    }

    fn user_events_key(user_id: &str) -> String {
        format!("user:events:{user_id}")
    }

    fn profile_key(user_id: &str) -> String {
        format!("user:profile:{user_id}")
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Record an event. Returns true when the event was accepted into the
    /// buffer (persistence is asynchronous).
    pub async fn record(
        &self,
        user_id: &str,
        event_type: EventType,
        data: Map<String, Value>,
        options: RecordOptions,
    ) -> bool {
        let validated = match validate_event_data(event_type, &data) {
            Ok(validated) => validated,
            Err(err) => {
                warn!(user_id, %err, "event rejected by schema validation");
                self.counters.events_failed.fetch_add(1, Ordering::Relaxed);
                let event = UserEvent {
                    event_id: create_event_id(),
                    user_id: user_id.to_string(),
                    event_type,
                    timestamp: Utc::now(),
                    session_id: options.session_id,
                    market_id: options.market_id,
                    ip_address: options.ip_address,
                    user_agent: options.user_agent,
                    data,
                };
                let mut buffers = self.buffers.lock().await;
                buffers.failed.push(event);
                self.cap_failed_buffer(&mut buffers);
                return false;
            }
        };

        let event = UserEvent {
            event_id: create_event_id(),
            user_id: user_id.to_string(),
            event_type,
            timestamp: Utc::now(),
            session_id: options.session_id,
            market_id: options.market_id,
            ip_address: options.ip_address,
            user_agent: options.user_agent,
            data: validated,
        };

        let batch = {
            let mut buffers = self.buffers.lock().await;
            buffers.pending.push(event);
            self.counters.events_buffered.fetch_add(1, Ordering::Relaxed);
            let due = buffers.pending.len() >= self.config.buffer_size
                || buffers.last_flush.elapsed() >= self.config.flush_interval;
            if due {
                Some(Self::take_pending(&mut buffers))
            } else {
                None
            }
        };

        // The profile is regenerated on next read rather than deleted now.
        if let Some(mut cached) = self.profile_cache.get_mut(user_id) {
            cached.needs_refresh = true;
        }

        if let Some(batch) = batch {
            let _ = self.persist_batch(batch).await;
        }
        true
    }

    /// Record a conversational intent event.
    pub async fn record_conversation_intent(
        &self,
        user_id: &str,
        intent_type: &str,
        query: &str,
        market_id: Option<String>,
    ) -> bool {
        let mut data = Map::new();
        data.insert("intent_type".into(), Value::String(intent_type.to_string()));
        data.insert("query".into(), Value::String(query.to_string()));
        self.record(
            user_id,
            EventType::ConversationIntent,
            data,
            RecordOptions {
                market_id,
                ..RecordOptions::default()
            },
        )
        .await
    }

    /// Drain and persist anything pending. Returns true when the batch (if
    /// any) reached the KV store.
    pub async fn flush(&self) -> bool {
        let batch = {
            let mut buffers = self.buffers.lock().await;
            if buffers.pending.is_empty() {
                return true;
            }
            Self::take_pending(&mut buffers)
        };
        self.persist_batch(batch).await
    }

    fn take_pending(buffers: &mut Buffers) -> Vec<UserEvent> {
        buffers.last_flush = Instant::now();
        std::mem::take(&mut buffers.pending)
    }

    /// Persist a batch behind the write breaker; on failure the batch is
    /// routed to the write fallback (failed buffer + journal).
    async fn persist_batch(&self, batch: Vec<UserEvent>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let count = batch.len();
        let result = self
            .write_breaker
            .call(|| self.bulk_persist(batch.clone()))
            .await;
        match result {
            Ok(()) => {
                debug!(count, "event batch persisted");
                true
            }
            Err(err) => {
                if matches!(err, Error::CircuitOpen { .. }) {
                    self.counters
                        .circuit_breaker_triggers
                        .fetch_add(1, Ordering::Relaxed);
                }
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(count, %err, "bulk persist failed, routing to write fallback");
                self.write_fallback(batch).await;
                false
            }
        }
    }

    /// The bulk persist itself: events, per-user index lists, profile
    /// invalidation, all through the plain KV surface.
    async fn bulk_persist(&self, batch: Vec<UserEvent>) -> Result<()> {
        let start = Instant::now();

        // Group by user to build index updates.
        let mut per_user: Vec<(String, Vec<String>)> = Vec::new();
        for event in &batch {
            let raw = serde_json::to_string(event)?;
            self.kv
                .set(&Self::event_key(&event.event_id), &raw, Some(EVENT_TTL))
                .await?;
            match per_user.iter_mut().find(|(user, _)| *user == event.user_id) {
                Some((_, ids)) => ids.push(event.event_id.clone()),
                None => per_user.push((event.user_id.clone(), vec![event.event_id.clone()])),
            }
        }

        for (user_id, new_ids) in &per_user {
            let index_key = Self::user_events_key(user_id);
            let existing: Vec<String> = kv::get_json(self.kv.as_ref(), &index_key)
                .await?
                .unwrap_or_default();

            // Newest first: later events in the batch go to the head.
            let mut index: Vec<String> = new_ids.iter().rev().cloned().collect();
            index.extend(existing);
            index.truncate(MAX_EVENTS_PER_USER);
            kv::set_json(self.kv.as_ref(), &index_key, &index, Some(EVENT_TTL)).await?;

            self.kv.delete(&[Self::profile_key(user_id)]).await?;
        }

        self.counters
            .events_stored
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.counters.bulk_operations.fetch_add(1, Ordering::Relaxed);
        self.update_latency(start.elapsed());
        Ok(())
    }

    /// Write fallback: park the batch for retry and spill it to the
    /// journal when one is configured.
    async fn write_fallback(&self, batch: Vec<UserEvent>) {
        self.counters.fallbacks_used.fetch_add(1, Ordering::Relaxed);
        {
            let mut buffers = self.buffers.lock().await;
            buffers.failed.extend(batch.iter().cloned());
            self.cap_failed_buffer(&mut buffers);
        }
        if self.config.fallback_dir.is_some() {
            if let Err(err) = self.journal_batch(&batch).await {
                warn!(%err, "could not journal failed batch");
            }
        }
    }

    fn cap_failed_buffer(&self, buffers: &mut Buffers) {
        let cap = self.config.buffer_size * 4;
        if buffers.failed.len() > cap {
            let drop_count = buffers.failed.len() - cap;
            buffers.failed.drain(..drop_count);
        }
    }

    async fn journal_batch(&self, batch: &[UserEvent]) -> Result<()> {
        let Some(dir) = &self.config.fallback_dir else {
            return Ok(());
        };
        let timestamp = Utc::now().timestamp();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let suffix = &nonce[..8];
        let path = dir.join(format!("events_fallback_{timestamp}_{suffix}.json"));
        let payload = JournalBatch {
            events: batch.to_vec(),
            timestamp,
        };
        tokio::fs::write(&path, serde_json::to_vec(&payload)?).await?;
        self.counters
            .local_storage_operations
            .fetch_add(1, Ordering::Relaxed);
        info!(?path, count = batch.len(), "batch journaled to disk");
        Ok(())
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Fetch a user's profile, materializing it when necessary. Never
    /// fails: degraded paths return a stale or empty profile.
    pub async fn get_profile(&self, user_id: &str) -> UserProfile {
        if let Some(cached) = self.profile_cache.get(user_id) {
            let fresh = cached.cached_at.elapsed() < self.config.cache_ttl;
            if fresh && !cached.needs_refresh {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return cached.profile.clone();
            }
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        let result = self.read_breaker.call(|| self.fetch_profile(user_id)).await;
        match result {
            Ok(profile) => {
                self.cache_profile(user_id, profile.clone());
                profile
            }
            Err(err) => {
                if matches!(err, Error::CircuitOpen { .. }) {
                    self.counters
                        .circuit_breaker_triggers
                        .fetch_add(1, Ordering::Relaxed);
                }
                self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                warn!(user_id, %err, "profile read failed, using fallback");
                self.read_fallback(user_id)
            }
        }
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile> {
        let start = Instant::now();
        let profile_key = Self::profile_key(user_id);

        if let Some(profile) = kv::get_json::<UserProfile>(self.kv.as_ref(), &profile_key).await? {
            self.update_latency(start.elapsed());
            return Ok(profile);
        }

        let profile = self.generate_profile(user_id).await?;
        kv::set_json(self.kv.as_ref(), &profile_key, &profile, Some(PROFILE_TTL)).await?;
        self.counters
            .profiles_generated
            .fetch_add(1, Ordering::Relaxed);
        self.update_latency(start.elapsed());
        Ok(profile)
    }

    async fn generate_profile(&self, user_id: &str) -> Result<UserProfile> {
        let events = self.user_events(user_id).await?;
        Ok(build_profile(user_id, &events))
    }

    /// Raw events for a user, newest first, rehydrated from the index list.
    pub async fn user_events(&self, user_id: &str) -> Result<Vec<UserEvent>> {
        let index: Vec<String> = kv::get_json(self.kv.as_ref(), &Self::user_events_key(user_id))
            .await?
            .unwrap_or_default();
        if index.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = index.iter().map(|id| Self::event_key(id)).collect();
        let raws = self.kv.get_many(&keys).await?;
        let mut events = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            match serde_json::from_str::<UserEvent>(&raw) {
                Ok(event) => events.push(event),
                Err(err) => debug!(%err, "skipping unparseable event record"),
            }
        }
        Ok(events)
    }

    /// Read fallback: serve any stale cached copy, else an empty profile.
    fn read_fallback(&self, user_id: &str) -> UserProfile {
        self.counters.fallbacks_used.fetch_add(1, Ordering::Relaxed);
        if let Some(cached) = self.profile_cache.get(user_id) {
            info!(user_id, "serving expired cached profile as fallback");
            let mut profile = cached.profile.clone();
            profile.fallback = Some("expired_cache".to_string());
            return profile;
        }
        let mut profile = UserProfile::empty(user_id);
        profile.fallback = Some("generated_empty".to_string());
        profile
    }

    fn cache_profile(&self, user_id: &str, profile: UserProfile) {
        self.profile_cache.insert(
            user_id.to_string(),
            CachedProfile {
                profile,
                cached_at: Instant::now(),
                needs_refresh: false,
            },
        );
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Periodic flush loop. Exits after a final drain once `shutdown`
    /// observes `true`.
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = self.flush().await;
                        info!("flush loop drained and stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Periodic recovery loop: retries the failed buffer and replays
    /// journal files while the write path is healthy.
    pub async fn run_recovery_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RECOVERY_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.recovery_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("recovery loop stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One recovery pass; public so tests and operators can force one.
    pub async fn recovery_tick(&self) {
        if self.write_breaker.state().await == CircuitState::Open {
            debug!("write circuit open, skipping recovery tick");
            return;
        }

        // Retry a bounded slice of the failed buffer.
        let retry_batch: Vec<UserEvent> = {
            let mut buffers = self.buffers.lock().await;
            let take = buffers.failed.len().min(RECOVERY_BATCH);
            buffers.failed.drain(..take).collect()
        };
        if !retry_batch.is_empty() {
            info!(count = retry_batch.len(), "retrying failed events");
            match self.bulk_persist(retry_batch.clone()).await {
                Ok(()) => {
                    self.counters
                        .recovery_operations
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!(%err, "failed-event retry unsuccessful, re-queueing");
                    let mut buffers = self.buffers.lock().await;
                    buffers.failed.extend(retry_batch);
                    self.cap_failed_buffer(&mut buffers);
                }
            }
        }

        if self.config.fallback_dir.is_some() {
            if let Err(err) = self.recover_journal().await {
                warn!(%err, "journal recovery pass failed");
            }
        }
    }

    /// Replay up to [`RECOVERY_FILES_PER_TICK`] journal files; corrupt
    /// files are quarantined under `corrupted/`.
    async fn recover_journal(&self) -> Result<()> {
        let Some(dir) = self.config.fallback_dir.clone() else {
            return Ok(());
        };
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("events_fallback_") && name.ends_with(".json") {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Ok(());
        }
        names.sort();
        info!(files = names.len(), "journal files found for recovery");

        for name in names.into_iter().take(RECOVERY_FILES_PER_TICK) {
            let path = dir.join(&name);
            match self.replay_journal_file(&path).await {
                Ok(true) => {
                    tokio::fs::remove_file(&path).await?;
                    self.counters
                        .recovery_operations
                        .fetch_add(1, Ordering::Relaxed);
                    info!(%name, "journal file recovered");
                }
                Ok(false) => {
                    warn!(%name, "journal replay failed, keeping file for next pass");
                }
                Err(err) => {
                    error!(%name, %err, "corrupt journal file, quarantining");
                    self.quarantine(&dir, &path, &name).await;
                }
            }
        }
        Ok(())
    }

    /// Returns Ok(true) on successful replay, Ok(false) on a persist
    /// failure worth retrying, Err on an unreadable file.
    async fn replay_journal_file(&self, path: &Path) -> Result<bool> {
        let raw = tokio::fs::read(path).await?;
        let batch: JournalBatch = serde_json::from_slice(&raw)?;
        if batch.events.is_empty() {
            return Ok(true);
        }
        match self.bulk_persist(batch.events).await {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!(%err, "journal batch persist failed");
                Ok(false)
            }
        }
    }

    async fn quarantine(&self, dir: &Path, path: &Path, name: &str) {
        let corrupted = dir.join("corrupted");
        if let Err(err) = tokio::fs::create_dir_all(&corrupted).await {
            warn!(%err, "could not create quarantine directory");
            return;
        }
        if let Err(err) = tokio::fs::rename(path, corrupted.join(name)).await {
            warn!(%err, "could not quarantine journal file, removing");
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    /// Final flush for shutdown; spills to the journal if the store is
    /// still down.
    pub async fn close(&self) {
        if !self.flush().await {
            warn!("final flush failed; pending events routed to fallback");
        }
    }

    // ========================================================================
    // Health and stats
    // ========================================================================

    /// Health verdict from the two breakers and a KV ping.
    pub async fn health_check(&self) -> HealthStatus {
        if self.kv.ping().await.is_err() {
            return HealthStatus::Unhealthy;
        }
        let read_open = self.read_breaker.state().await == CircuitState::Open;
        let write_open = self.write_breaker.state().await == CircuitState::Open;
        match (read_open, write_open) {
            (false, false) => HealthStatus::Healthy,
            (true, true) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        }
    }

    /// Full metrics snapshot.
    pub async fn stats(&self) -> EventStoreMetrics {
        let (pending, failed) = {
            let buffers = self.buffers.lock().await;
            (buffers.pending.len(), buffers.failed.len())
        };
        EventStoreMetrics {
            events_stored: self.counters.events_stored.load(Ordering::Relaxed),
            events_buffered: self.counters.events_buffered.load(Ordering::Relaxed),
            events_failed: self.counters.events_failed.load(Ordering::Relaxed),
            profiles_generated: self.counters.profiles_generated.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
            bulk_operations: self.counters.bulk_operations.load(Ordering::Relaxed),
            fallbacks_used: self.counters.fallbacks_used.load(Ordering::Relaxed),
            circuit_breaker_triggers: self
                .counters
                .circuit_breaker_triggers
                .load(Ordering::Relaxed),
            recovery_operations: self.counters.recovery_operations.load(Ordering::Relaxed),
            local_storage_operations: self
                .counters
                .local_storage_operations
                .load(Ordering::Relaxed),
            kv_latency_ms: *self.kv_latency_ms.lock(),
            pending_buffer_size: pending,
            failed_buffer_size: failed,
            profile_cache_size: self.profile_cache.len(),
            read_circuit_breaker: self.read_breaker.stats().await,
            write_circuit_breaker: self.write_breaker.stats().await,
        }
    }

    /// The write-path breaker, for tests and the factory health surface.
    #[must_use]
    pub fn write_breaker(&self) -> &CircuitBreaker {
        &self.write_breaker
    }

    /// The read-path breaker.
    #[must_use]
    pub fn read_breaker(&self) -> &CircuitBreaker {
        &self.read_breaker
    }

    fn update_latency(&self, elapsed: Duration) {
        let sample_ms = elapsed.as_secs_f64() * 1000.0;
        let mut latency = self.kv_latency_ms.lock();
        *latency = if *latency == 0.0 {
            sample_ms
        } else {
            *latency * 0.9 + sample_ms * 0.1
        };
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("buffer_size", &self.config.buffer_size)
            .field("journal", &self.config.fallback_dir)
            .finish()
    }
}
