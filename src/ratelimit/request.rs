//! Request, result, and state key types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::algorithm::Decision;

/// Separator between the rule id and the request key in a state key.
pub const KEY_SEPARATOR: char = '|';

/// A single admission request.
///
/// Only `key`, `cost`, and `timestamp` take part in the budget arithmetic; the
/// remaining attributes are used for rule matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRequest {
    /// Budget identity, e.g. a client id or API key
    pub key: String,
    /// Units consumed by this request
    #[serde(default = "default_cost")]
    pub cost: u64,
    /// Epoch milliseconds; the current time is used when absent
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_cost() -> u64 {
    1
}

impl RateLimitRequest {
    /// Create a request for `key` with a cost of 1.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cost: default_cost(),
            timestamp: None,
            path: None,
            method: None,
            client_id: None,
            tags: Vec::new(),
            headers: HashMap::new(),
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Pin the request to an explicit time in epoch milliseconds.
    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header value, ignoring the case of the header name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The decision returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Units left in the budget, always within `0..=limit`
    pub remaining: u64,
    pub limit: u64,
    /// Milliseconds until the budget recovers
    pub reset_ms: u64,
    /// Set only on denial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Id of the matched rule, `None` when no rule applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// 1-based position, set only when the request was queued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// Id of the queue entry, set only when the request was queued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<Uuid>,
}

impl RateLimitResult {
    /// Build a result from an algorithm decision for the given rule.
    pub fn from_decision(decision: Decision, rule_id: &str) -> Self {
        Self {
            allowed: decision.allowed,
            remaining: decision.remaining.min(decision.limit),
            limit: decision.limit,
            reset_ms: decision.reset_ms,
            retry_after_ms: if decision.allowed {
                None
            } else {
                decision.retry_after_ms
            },
            rule: Some(rule_id.to_string()),
            queue_position: None,
            queue_id: None,
        }
    }

    /// Result for a request no rule applies to.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            limit: u64::MAX,
            reset_ms: 0,
            retry_after_ms: None,
            rule: None,
            queue_position: None,
            queue_id: None,
        }
    }

    /// Fraction of the budget in use, in `0.0..=1.0`.
    pub fn usage(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        1.0 - self.remaining as f64 / self.limit as f64
    }
}

/// Identifies one piece of limiter state: a request key under a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub rule_id: String,
    pub key: String,
}

impl StateKey {
    pub fn new(key: &str, rule_id: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            key: key.to_string(),
        }
    }

    /// Flatten into the string used by state stores.
    ///
    /// Rule ids never contain [`KEY_SEPARATOR`], so the first separator splits
    /// the two parts unambiguously.
    pub fn to_string_key(&self) -> String {
        format!("{}{}{}", self.rule_id, KEY_SEPARATOR, self.key)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_from_json() {
        let request: RateLimitRequest = serde_json::from_str(r#"{"key": "client-a"}"#).unwrap();
        assert_eq!(request.key, "client-a");
        assert_eq!(request.cost, 1);
        assert!(request.timestamp.is_none());
        assert!(request.tags.is_empty());
    }

    #[test]
    fn test_header_lookup_ignores_name_case() {
        let request = RateLimitRequest::new("k").with_header("X-Api-Tier", "gold");
        assert_eq!(request.header("x-api-tier"), Some("gold"));
        assert_eq!(request.header("x-other"), None);
    }

    #[test]
    fn test_state_key_keeps_separator_in_request_key() {
        let key = StateKey::new("user|42", "api");
        assert_eq!(key.to_string_key(), "api|user|42");
        assert_eq!(key.to_string(), "api|user|42");
    }

    #[test]
    fn test_result_drops_retry_after_when_allowed() {
        let decision = Decision {
            allowed: true,
            remaining: 3,
            limit: 5,
            reset_ms: 100,
            retry_after_ms: Some(10),
        };
        let result = RateLimitResult::from_decision(decision, "rule");
        assert_eq!(result.retry_after_ms, None);
        assert_eq!(result.rule.as_deref(), Some("rule"));
        assert!((result.usage() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_result_serialization_skips_empty_fields() {
        let json = serde_json::to_value(RateLimitResult::unlimited()).unwrap();
        assert!(json.get("retry_after_ms").is_none());
        assert!(json.get("queue_position").is_none());
        assert_eq!(json["allowed"], true);
    }
}
