//! Rate limit rules and priority-ordered matching.
//!
//! A rule pairs match criteria with an algorithm configuration. Rules are kept
//! sorted by descending priority and the first enabled rule whose criteria all
//! hold for a request wins. When nothing matches, the optional default rule
//! applies.

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::algorithm::AlgorithmConfig;
use super::presets::Preset;
use super::request::{RateLimitRequest, KEY_SEPARATOR};
use crate::error::{Result, TurnstileError};

/// What happens to a request once its budget is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnLimit {
    #[default]
    Reject,
    Queue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default)]
    pub on_limit: OnLimit,
}

/// Criteria a request must satisfy for a rule to apply.
///
/// Absent criteria always hold. A present criterion fails when the request
/// does not carry the attribute it inspects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Glob over the request path: `*` matches any run, `?` any single character
    #[serde(default)]
    pub path: Option<String>,
    /// Accepted HTTP methods, compared case-insensitively
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Tags that must all be present on the request
    #[serde(default)]
    pub tags: Vec<String>,
    /// Header values that must match exactly
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A configured rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub id: String,
    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, rename = "match")]
    pub matcher: RuleMatch,
    /// Either a literal algorithm config or `{ preset: <name> }`
    #[serde(deserialize_with = "deserialize_algorithm")]
    pub config: AlgorithmConfig,
    #[serde(default)]
    pub actions: RuleActions,
}

fn default_enabled() -> bool {
    true
}

/// Accept `{ preset: <name> }` or a tagged algorithm config.
///
/// The two shapes are told apart by the `preset` field so that errors name the
/// offending preset or algorithm tag.
fn deserialize_algorithm<'de, D>(deserializer: D) -> std::result::Result<AlgorithmConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    if let Some(preset) = value.get("preset") {
        return Preset::deserialize(preset)
            .map(|preset| preset.config())
            .map_err(|e| D::Error::custom(format!("invalid preset: {}", e)));
    }
    AlgorithmConfig::deserialize(value)
        .map_err(|e| D::Error::custom(format!("invalid algorithm config: {}", e)))
}

impl RateLimitRule {
    /// Create an enabled, match-all rule with priority 0.
    pub fn new(id: impl Into<String>, config: AlgorithmConfig) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            enabled: true,
            matcher: RuleMatch::default(),
            config,
            actions: RuleActions::default(),
        }
    }

    pub fn from_preset(id: impl Into<String>, preset: Preset) -> Self {
        Self::new(id, preset.config())
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_match(mut self, matcher: RuleMatch) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn on_limit(mut self, on_limit: OnLimit) -> Self {
        self.actions.on_limit = on_limit;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Translate a path glob into an anchored regular expression.
fn glob_to_regex(glob: &str) -> std::result::Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// A validated rule with its path glob compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: RateLimitRule,
    path: Option<Regex>,
}

impl CompiledRule {
    /// Validate a rule and compile its matcher.
    pub fn compile(rule: RateLimitRule) -> Result<Self> {
        let invalid = |reason: String| TurnstileError::InvalidRule {
            rule_id: rule.id.clone(),
            reason,
        };

        if rule.id.is_empty() {
            return Err(invalid("rule id must not be empty".to_string()));
        }
        if rule.id.contains(KEY_SEPARATOR) {
            return Err(invalid(format!(
                "rule id must not contain '{}'",
                KEY_SEPARATOR
            )));
        }
        rule.config.validate().map_err(invalid)?;

        let path = match &rule.matcher.path {
            Some(glob) => Some(
                glob_to_regex(glob)
                    .map_err(|e| invalid(format!("invalid path glob '{}': {}", glob, e)))?,
            ),
            None => None,
        };

        Ok(Self { rule, path })
    }

    pub fn id(&self) -> &str {
        &self.rule.id
    }

    /// Check every present criterion, stopping at the first that fails.
    pub fn matches(&self, request: &RateLimitRequest) -> bool {
        let criteria = &self.rule.matcher;

        if let Some(ref pattern) = self.path {
            match request.path.as_deref() {
                Some(path) if pattern.is_match(path) => {}
                _ => return false,
            }
        }

        if !criteria.methods.is_empty() {
            let Some(method) = request.method.as_deref() else {
                return false;
            };
            if !criteria
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method))
            {
                return false;
            }
        }

        if let Some(ref client_id) = criteria.client_id {
            if request.client_id.as_deref() != Some(client_id.as_str()) {
                return false;
            }
        }

        if !criteria.tags.iter().all(|tag| request.tags.contains(tag)) {
            return false;
        }

        criteria
            .headers
            .iter()
            .all(|(name, value)| request.header(name) == Some(value.as_str()))
    }
}

/// The ordered rule list plus the fallback rule.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<CompiledRule>>,
    default_rule: Option<Arc<CompiledRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, replacing any rule with the same id, and re-sort by priority.
    ///
    /// Rules with equal priority keep their insertion order.
    pub fn insert(&mut self, rule: RateLimitRule) -> Result<()> {
        let compiled = Arc::new(CompiledRule::compile(rule)?);
        self.rules.retain(|r| r.id() != compiled.id());
        self.rules.push(compiled);
        self.rules
            .sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Ok(())
    }

    /// Remove a rule by id. Returns `true` if it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id() != id);
        self.rules.len() != before
    }

    pub fn get(&self, id: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|r| r.id() == id).map(|r| &r.rule)
    }

    /// All rules in evaluation order.
    pub fn rules(&self) -> Vec<RateLimitRule> {
        self.rules.iter().map(|r| r.rule.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn set_default(&mut self, rule: Option<RateLimitRule>) -> Result<()> {
        self.default_rule = match rule {
            Some(rule) => Some(Arc::new(CompiledRule::compile(rule)?)),
            None => None,
        };
        Ok(())
    }

    pub fn default_rule(&self) -> Option<&RateLimitRule> {
        self.default_rule.as_ref().map(|r| &r.rule)
    }

    /// Ids of every rule that can own state, including the default rule.
    pub fn rule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rules.iter().map(|r| r.id().to_string()).collect();
        if let Some(ref default_rule) = self.default_rule {
            if !ids.iter().any(|id| id == default_rule.id()) {
                ids.push(default_rule.id().to_string());
            }
        }
        ids
    }

    /// Find the rule that applies to a request.
    ///
    /// Returns `None` when no enabled rule matches and there is no enabled
    /// default rule, meaning the request is not limited.
    pub fn find(&self, request: &RateLimitRequest) -> Option<Arc<CompiledRule>> {
        self.rules
            .iter()
            .filter(|r| r.rule.enabled)
            .find(|r| r.matches(request))
            .or_else(|| self.default_rule.as_ref().filter(|r| r.rule.enabled))
            .cloned()
    }
}
