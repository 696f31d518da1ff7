// Copyright 2026 MerchFlow Contributors

//! Collaborative-filtering engine interface
//!
//! The collaborative engine is remote and opaque: it accepts user/product
//! context and returns scored product IDs, and it ingests user events for
//! online learning. Transport failures collapse into
//! [`Error::RemoteRecommenderFailed`]; the hybrid recommender degrades to
//! the content engine and the fallback ladder rather than surfacing them.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{EventType, ScoredId, UserEvent};

/// Default request deadline for the remote engine.
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// An opaque scored-ID recommender with an event-ingestion side channel.
#[async_trait]
pub trait CollaborativeEngine: Send + Sync {
    /// Scored candidate product IDs for a user, optionally anchored on a
    /// product.
    async fn recommend(
        &self,
        user_id: &str,
        product_id: Option<&str>,
        n: usize,
    ) -> Result<Vec<ScoredId>>;

    /// Forward a user event for online learning. Returns the engine's
    /// acknowledgment payload.
    async fn record_event(
        &self,
        user_id: &str,
        event_type: EventType,
        product_id: Option<&str>,
        amount: Option<f64>,
    ) -> Result<Map<String, Value>>;

    /// Events the engine has seen for a user, newest first. Used to build
    /// the seen-product exclusion set when no event store is wired.
    async fn user_events(&self, user_id: &str) -> Result<Vec<UserEvent>>;
}

// ============================================================================
// Remote HTTP client
// ============================================================================

#[derive(Debug, Serialize)]
struct RecommendRequest<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_id: Option<&'a str>,
    n: usize,
}

#[derive(Debug, Deserialize)]
struct RecommendResponse {
    #[serde(default)]
    recommendations: Vec<ScoredId>,
}

#[derive(Debug, Serialize)]
struct EventRequest<'a> {
    user_id: &'a str,
    event_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<f64>,
}

/// HTTP client for the remote collaborative-filtering service.
#[derive(Debug, Clone)]
pub struct RemoteCollaborativeClient {
    http: reqwest::Client,
    base_url: String,
}

impl RemoteCollaborativeClient {
    /// Create a client against the service's base URL with the default
    /// deadline.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, REMOTE_TIMEOUT)
    }

    /// Create a client with an explicit request deadline.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RemoteRecommenderFailed(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl CollaborativeEngine for RemoteCollaborativeClient {
    async fn recommend(
        &self,
        user_id: &str,
        product_id: Option<&str>,
        n: usize,
    ) -> Result<Vec<ScoredId>> {
        let request = RecommendRequest {
            user_id,
            product_id,
            n,
        };
        let response = self
            .http
            .post(self.url("/v1/recommendations"))
            .json(&request)
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?;
        let body: RecommendResponse = response.json().await.map_err(remote_err)?;
        debug!(user_id, count = body.recommendations.len(), "collaborative candidates received");
        Ok(body.recommendations)
    }

    async fn record_event(
        &self,
        user_id: &str,
        event_type: EventType,
        product_id: Option<&str>,
        amount: Option<f64>,
    ) -> Result<Map<String, Value>> {
        let request = EventRequest {
            user_id,
            event_type: event_type.as_str(),
            product_id,
            amount,
        };
        let response = self
            .http
            .post(self.url("/v1/events"))
            .json(&request)
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?;
        response.json().await.map_err(remote_err)
    }

    async fn user_events(&self, user_id: &str) -> Result<Vec<UserEvent>> {
        let response = self
            .http
            .get(self.url(&format!("/v1/users/{user_id}/events")))
            .send()
            .await
            .map_err(remote_err)?
            .error_for_status()
            .map_err(remote_err)?;
        response.json().await.map_err(remote_err)
    }
}

fn remote_err(err: reqwest::Error) -> Error {
    warn!(%err, "remote collaborative engine call failed");
    Error::RemoteRecommenderFailed(err.to_string())
}

// ============================================================================
// Static in-process double
// ============================================================================

/// In-process collaborative engine serving a fixed candidate list.
///
/// Used in tests and as the factory's inert stand-in when no remote engine
/// is configured; an empty instance simply yields no candidates and the
/// hybrid recommender degrades to the content engine.
#[derive(Debug, Default)]
pub struct StaticCollaborativeEngine {
    candidates: RwLock<Vec<ScoredId>>,
    recorded: RwLock<Vec<(String, EventType, Option<String>)>>,
}

impl StaticCollaborativeEngine {
    /// Engine that always returns no candidates.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Engine serving the given candidates to every user.
    #[must_use]
    pub fn with_candidates(candidates: Vec<ScoredId>) -> Self {
        Self {
            candidates: RwLock::new(candidates),
            recorded: RwLock::new(Vec::new()),
        }
    }

    /// Replace the served candidates.
    pub fn set_candidates(&self, candidates: Vec<ScoredId>) {
        *self.candidates.write() = candidates;
    }

    /// Events recorded through this engine, in order.
    #[must_use]
    pub fn recorded_events(&self) -> Vec<(String, EventType, Option<String>)> {
        self.recorded.read().clone()
    }
}

#[async_trait]
impl CollaborativeEngine for StaticCollaborativeEngine {
    async fn recommend(
        &self,
        _user_id: &str,
        _product_id: Option<&str>,
        n: usize,
    ) -> Result<Vec<ScoredId>> {
        let mut candidates = self.candidates.read().clone();
        candidates.truncate(n);
        Ok(candidates)
    }

    async fn record_event(
        &self,
        user_id: &str,
        event_type: EventType,
        product_id: Option<&str>,
        _amount: Option<f64>,
    ) -> Result<Map<String, Value>> {
        self.recorded.write().push((
            user_id.to_string(),
            event_type,
            product_id.map(str::to_string),
        ));
        let mut ack = Map::new();
        ack.insert("status".into(), Value::String("recorded".into()));
        Ok(ack)
    }

    async fn user_events(&self, _user_id: &str) -> Result<Vec<UserEvent>> {
        Ok(Vec::new())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_engine_serves_and_truncates() {
        let engine = StaticCollaborativeEngine::with_candidates(vec![
            ScoredId::new("p1", 0.9),
            ScoredId::new("p2", 0.8),
            ScoredId::new("p3", 0.7),
        ]);
        let out = engine.recommend("u1", None, 2).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "p1");
    }

    #[tokio::test]
    async fn static_engine_records_events() {
        let engine = StaticCollaborativeEngine::empty();
        let ack = engine
            .record_event("u1", EventType::Purchase, Some("p1"), Some(19.99))
            .await
            .unwrap();
        assert_eq!(ack.get("status"), Some(&Value::String("recorded".into())));
        let recorded = engine.recorded_events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1, EventType::Purchase);
    }

    #[tokio::test]
    async fn remote_client_maps_connection_errors() {
        // Unroutable port; the request must fail fast with the remote kind.
        let client = RemoteCollaborativeClient::with_timeout(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
        )
        .unwrap();
        let err = client.recommend("u1", None, 5).await.unwrap_err();
        assert!(matches!(err, Error::RemoteRecommenderFailed(_)));
    }
}
