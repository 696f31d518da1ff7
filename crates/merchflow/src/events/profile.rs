// Copyright 2026 MerchFlow Contributors

//! Profile materialization
//!
//! Builds the derived [`UserProfile`] from a user's raw event slice in a
//! single pass. Events arrive newest first (the order of the per-user
//! index list), so the "last N" slices are the first N encountered.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde_json::Value;

use crate::types::{EventType, UserEvent, UserProfile};

use super::schema::activity_level;

const MAX_INTENTS: usize = 10;
const MAX_SEARCHES: usize = 20;
const MAX_PURCHASES: usize = 10;

/// Materialize a profile from a user's events, newest first.
#[must_use]
pub fn build_profile(user_id: &str, events: &[UserEvent]) -> UserProfile {
    if events.is_empty() {
        let mut profile = UserProfile::empty(user_id);
        profile.source = "generated".to_string();
        return profile;
    }

    let first_activity = events.iter().map(|e| e.timestamp).min().unwrap_or_else(Utc::now);
    let last_activity = events.iter().map(|e| e.timestamp).max().unwrap_or_else(Utc::now);
    // Same-day activity counts as one active day.
    let days_active = (last_activity - first_activity).num_days() + 1;

    let mut intent_history = Vec::new();
    let mut category_views: BTreeMap<String, u64> = BTreeMap::new();
    let mut search_patterns = Vec::new();
    let mut purchase_history = Vec::new();
    let mut session_ids: HashSet<&str> = HashSet::new();
    let mut market_preferences: BTreeMap<String, u64> = BTreeMap::new();

    for event in events {
        if let Some(session) = event.session_id.as_deref() {
            if !session.is_empty() {
                session_ids.insert(session);
            }
        }
        if let Some(market) = event.market_id.as_deref() {
            if !market.is_empty() {
                *market_preferences.entry(market.to_string()).or_insert(0) += 1;
            }
        }

        match event.event_type {
            EventType::ConversationIntent => {
                if intent_history.len() < MAX_INTENTS {
                    intent_history.push(event.data.clone());
                }
            }
            EventType::ProductView => {
                if let Some(category) = event
                    .data
                    .get("product_category")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                {
                    *category_views.entry(category.to_string()).or_insert(0) += 1;
                }
            }
            EventType::ProductSearch => {
                if search_patterns.len() < MAX_SEARCHES {
                    if let Some(query) = event.data.get("query").and_then(Value::as_str) {
                        search_patterns.push(query.to_string());
                    }
                }
            }
            EventType::Purchase => {
                if purchase_history.len() < MAX_PURCHASES {
                    purchase_history.push(event.data.clone());
                }
            }
            EventType::AddToCart | EventType::Generic => {}
        }
    }

    // Normalize category affinity to [0, 1], summing to 1 over observed
    // categories.
    let total_views: u64 = category_views.values().sum();
    let category_affinity: BTreeMap<String, f64> = if total_views > 0 {
        category_views
            .into_iter()
            .map(|(category, count)| (category, count as f64 / total_views as f64))
            .collect()
    } else {
        BTreeMap::new()
    };

    let session_count = session_ids.len();
    let level = activity_level(events.len(), session_count, days_active);

    UserProfile {
        user_id: user_id.to_string(),
        total_events: events.len(),
        first_activity,
        last_activity,
        intent_history,
        category_affinity,
        search_patterns,
        session_count,
        market_preferences,
        purchase_history,
        days_active,
        activity_level: level,
        generated_at: Utc::now(),
        source: "generated".to_string(),
        fallback: None,
    }
}
