// Copyright 2026 MerchFlow Contributors

//! Per-type event payload validation
//!
//! Each event type has a small required-field schema. Validation failures
//! are [`Error::SchemaInvalid`]; the store counts them and parks the raw
//! payload in the failed buffer instead of persisting it.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ActivityLevel, EventType};

/// Validate an event payload against its type's schema, returning the
/// payload unchanged on success.
pub fn validate_event_data(
    event_type: EventType,
    data: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    match event_type {
        EventType::ProductView => {
            require_string(event_type, data, "product_id")?;
        }
        EventType::ProductSearch => {
            require_string(event_type, data, "query")?;
        }
        EventType::AddToCart => {
            require_string(event_type, data, "product_id")?;
        }
        EventType::Purchase => {
            require_string(event_type, data, "product_id")?;
            let amount = data
                .get("amount")
                .and_then(Value::as_f64)
                .ok_or_else(|| invalid(event_type, "missing or non-numeric 'amount'"))?;
            if amount < 0.0 {
                return Err(invalid(event_type, "'amount' must be non-negative"));
            }
        }
        EventType::ConversationIntent => {
            require_string(event_type, data, "intent_type")?;
        }
        EventType::Generic => {}
    }
    Ok(data.clone())
}

fn require_string(event_type: EventType, data: &Map<String, Value>, field: &str) -> Result<()> {
    match data.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(_) => Err(invalid(event_type, &format!("'{field}' must be a non-empty string"))),
        None => Err(invalid(event_type, &format!("missing '{field}'"))),
    }
}

fn invalid(event_type: EventType, reason: &str) -> Error {
    Error::SchemaInvalid {
        event_type: event_type.as_str().to_string(),
        reason: reason.to_string(),
    }
}

/// Generate a globally unique event ID.
#[must_use]
pub fn create_event_id() -> String {
    format!("evt_{}", Uuid::new_v4().simple())
}

/// Classify a user's activity from event count, session count and active
/// days. Monotone in all three inputs.
#[must_use]
pub fn activity_level(total_events: usize, session_count: usize, days_active: i64) -> ActivityLevel {
    if total_events >= 50 || (total_events >= 20 && session_count >= 10) {
        ActivityLevel::High
    } else if total_events >= 20 || (total_events >= 5 && session_count >= 5 && days_active >= 7) {
        ActivityLevel::Medium
    } else if total_events >= 5 {
        ActivityLevel::Low
    } else {
        ActivityLevel::New
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn product_view_requires_product_id() {
        let ok = map(&[("product_id", Value::String("p1".into()))]);
        assert!(validate_event_data(EventType::ProductView, &ok).is_ok());

        let missing = map(&[]);
        assert!(matches!(
            validate_event_data(EventType::ProductView, &missing),
            Err(Error::SchemaInvalid { .. })
        ));

        let wrong_type = map(&[("product_id", Value::Number(1.into()))]);
        assert!(validate_event_data(EventType::ProductView, &wrong_type).is_err());
    }

    #[test]
    fn search_requires_query() {
        let ok = map(&[("query", Value::String("running shoes".into()))]);
        assert!(validate_event_data(EventType::ProductSearch, &ok).is_ok());
        assert!(validate_event_data(EventType::ProductSearch, &map(&[])).is_err());
    }

    #[test]
    fn purchase_requires_non_negative_amount() {
        let ok = map(&[
            ("product_id", Value::String("p1".into())),
            ("amount", serde_json::json!(19.99)),
        ]);
        assert!(validate_event_data(EventType::Purchase, &ok).is_ok());

        let negative = map(&[
            ("product_id", Value::String("p1".into())),
            ("amount", serde_json::json!(-5.0)),
        ]);
        assert!(validate_event_data(EventType::Purchase, &negative).is_err());

        let missing_amount = map(&[("product_id", Value::String("p1".into()))]);
        assert!(validate_event_data(EventType::Purchase, &missing_amount).is_err());
    }

    #[test]
    fn intent_requires_intent_type() {
        let ok = map(&[("intent_type", Value::String("initial_electronics".into()))]);
        assert!(validate_event_data(EventType::ConversationIntent, &ok).is_ok());
        assert!(validate_event_data(EventType::ConversationIntent, &map(&[])).is_err());
    }

    #[test]
    fn generic_accepts_anything() {
        assert!(validate_event_data(EventType::Generic, &map(&[])).is_ok());
        let arbitrary = map(&[("anything", Value::Bool(true))]);
        assert!(validate_event_data(EventType::Generic, &arbitrary).is_ok());
    }

    #[test]
    fn event_ids_are_unique() {
        let a = create_event_id();
        let b = create_event_id();
        assert_ne!(a, b);
        assert!(a.starts_with("evt_"));
    }

    #[test]
    fn activity_level_thresholds() {
        assert_eq!(activity_level(0, 0, 0), ActivityLevel::New);
        assert_eq!(activity_level(4, 1, 1), ActivityLevel::New);
        assert_eq!(activity_level(5, 1, 1), ActivityLevel::Low);
        assert_eq!(activity_level(19, 2, 3), ActivityLevel::Low);
        assert_eq!(activity_level(20, 2, 3), ActivityLevel::Medium);
        assert_eq!(activity_level(49, 5, 10), ActivityLevel::Medium);
        assert_eq!(activity_level(50, 5, 10), ActivityLevel::High);
        assert_eq!(activity_level(25, 12, 30), ActivityLevel::High);
    }

    #[test]
    fn activity_level_is_monotone_in_events() {
        let mut previous = ActivityLevel::New;
        for events in 0..100 {
            let level = activity_level(events, 3, 5);
            assert!(level >= previous);
            previous = level;
        }
    }
}
