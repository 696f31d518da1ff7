// Copyright 2026 MerchFlow Contributors

//! Resilient append-only user event store
//!
//! Events are validated against per-type schemas, buffered in memory and
//! flushed to the KV store in bulk. The read path (profile materialization)
//! and the write path (bulk persist) are guarded by independent circuit
//! breakers so a degraded write path never blocks profile reads and vice
//! versa. When the write path is down, batches land in an on-disk fallback
//! journal that a background task replays once the store recovers.
//!
//! Key-space layout:
//!
//! - `event:<event_id>` - JSON event record, 30 day TTL
//! - `user:events:<user_id>` - JSON array of event IDs, newest first,
//!   capped at 1000, 30 day TTL
//! - `user:profile:<user_id>` - JSON profile, 24 hour TTL

pub mod profile;
pub mod schema;
mod store;

pub use store::{EventStore, EventStoreConfig, EventStoreMetrics, RecordOptions};
