// Copyright 2026 MerchFlow Contributors

//! Error types for the recommendation core
//!
//! Infrastructure failures (KV outage, remote engine errors, open circuit
//! breakers, timeouts) are degradable: callers route them to fallback paths
//! and they never surface past the core. Not-found is modeled as `Option`
//! at every tier boundary, never as an error.

use std::time::Duration;

/// Errors produced by the recommendation core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The backing key-value store is unreachable or an operation against it
    /// failed. Every KV adapter failure collapses into this single kind.
    #[error("KV store unavailable: {0}")]
    KvUnavailable(String),

    /// The remote collaborative-filtering engine failed or timed out.
    #[error("remote recommender failed: {0}")]
    RemoteRecommenderFailed(String),

    /// A guarded operation was rejected because its circuit breaker is open
    /// and no fallback was supplied.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        name: String,
    },

    /// Event data failed per-type schema validation.
    #[error("invalid event data for '{event_type}': {reason}")]
    SchemaInvalid {
        /// Event type whose schema was violated
        event_type: String,
        /// What was missing or malformed
        reason: String,
    },

    /// A bounded wait expired.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure in the fallback journal.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything that does not fit the kinds above.
    #[error("{0}")]
    Generic(String),
}

/// Convenience result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is an infrastructure failure the core degrades
    /// around, as opposed to a logic error that should be surfaced.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::KvUnavailable(_)
                | Self::RemoteRecommenderFailed(_)
                | Self::CircuitOpen { .. }
                | Self::Timeout(_)
        )
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_are_degradable() {
        assert!(Error::KvUnavailable("refused".into()).is_infrastructure());
        assert!(Error::Timeout(Duration::from_secs(2)).is_infrastructure());
        assert!(Error::CircuitOpen { name: "kv".into() }.is_infrastructure());
        assert!(!Error::SchemaInvalid {
            event_type: "purchase".into(),
            reason: "missing amount".into()
        }
        .is_infrastructure());
        assert!(!Error::Generic("bug".into()).is_infrastructure());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::SchemaInvalid {
            event_type: "product-view".into(),
            reason: "missing product_id".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("product-view"));
        assert!(msg.contains("missing product_id"));
    }
}
