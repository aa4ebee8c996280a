//! The limiter: rule matching, algorithm state, queueing, stats and events.

use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::algorithm::{self, AlgorithmConfig, Decision, LimiterState};
use super::events::{EventBus, LimiterEvent};
use super::queue::{QueueConfig, QueueManager, QueuedRequest};
use super::request::{RateLimitRequest, RateLimitResult, StateKey};
use super::rules::{CompiledRule, OnLimit, RateLimitRule, RuleSet};
use super::stats::{RateLimitStats, StatsTracker};
use super::store::{MemoryStore, StateStore};
use crate::config::{FailurePolicy, LimiterConfig};
use crate::error::{Result, TurnstileError};

/// Number of striped locks serializing read-modify-write per state key.
const LOCK_STRIPES: usize = 64;

/// Name given to limiters created outside a registry.
pub const DEFAULT_LIMITER_NAME: &str = "default";

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Striped async locks. Two keys may share a stripe; one key always maps to
/// the same stripe, which is what makes its read-modify-write atomic.
struct KeyLocks {
    stripes: Vec<tokio::sync::Mutex<()>>,
}

impl KeyLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, key: &str) -> tokio::sync::MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[index].lock().await
    }
}

struct CleanupTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// An independent rate limiter.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
/// Call [`Limiter::destroy`] when done to stop background cleanup; dropping the
/// limiter does the same.
pub struct Limiter {
    name: String,
    rules: RwLock<RuleSet>,
    store: Arc<dyn StateStore>,
    locks: KeyLocks,
    queue: QueueManager,
    queue_config: Option<QueueConfig>,
    stats: Arc<StatsTracker>,
    events: EventBus,
    failure_policy: FailurePolicy,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.name)
            .field("rules", &self.rules.read().len())
            .field("store", &self.store.store_type())
            .field("queue_config", &self.queue_config)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

impl Limiter {
    /// Create a limiter backed by an in-memory store.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_store(DEFAULT_LIMITER_NAME, config, Arc::new(MemoryStore::new()))
    }

    /// Create a named limiter backed by an in-memory store.
    pub fn named(name: &str, config: LimiterConfig) -> Result<Self> {
        Self::with_store(name, config, Arc::new(MemoryStore::new()))
    }

    /// Create a limiter with a custom state store.
    ///
    /// Rules are validated here; an invalid rule fails construction. Background
    /// cleanup is started when called inside a tokio runtime.
    pub fn with_store(
        name: &str,
        config: LimiterConfig,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let mut rules = RuleSet::new();
        for rule in config.rules {
            rules.insert(rule)?;
        }
        rules.set_default(config.default_rule)?;

        let stats = Arc::new(StatsTracker::new());
        let cleanup = spawn_cleanup(
            name,
            store.clone(),
            stats.clone(),
            Duration::from_millis(config.cleanup_interval_ms),
            Duration::from_millis(config.stats_retention_ms),
        );

        info!(
            limiter = %name,
            rules = rules.len(),
            has_default = rules.default_rule().is_some(),
            store = store.store_type(),
            "Limiter created"
        );

        Ok(Self {
            name: name.to_string(),
            rules: RwLock::new(rules),
            store,
            locks: KeyLocks::new(LOCK_STRIPES),
            queue: QueueManager::new(),
            queue_config: config.queue,
            stats,
            events: EventBus::new(),
            failure_policy: config.store_failure,
            cleanup: Mutex::new(cleanup),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decide on a request without ever failing.
    ///
    /// The new state is persisted whether or not the request is allowed.
    pub async fn check(&self, request: &RateLimitRequest) -> RateLimitResult {
        self.decide(request).await.0
    }

    /// Decide on a request, queueing or failing it when denied.
    ///
    /// A denied request is queued when its rule's `on_limit` is `queue`, a
    /// queue is configured, and the key's queue has room; the returned result
    /// then carries `queue_position`. Otherwise this returns
    /// [`TurnstileError::RateLimitExceeded`].
    pub async fn consume(&self, request: &RateLimitRequest) -> Result<RateLimitResult> {
        let (result, rule, now) = self.decide(request).await;
        if result.allowed {
            return Ok(result);
        }

        if let Some((position, id)) = rule.and_then(|rule| self.try_queue(request, &rule, now)) {
            return Ok(RateLimitResult {
                queue_position: Some(position),
                queue_id: Some(id),
                ..result
            });
        }

        Err(TurnstileError::RateLimitExceeded {
            key: request.key.clone(),
            result: Box::new(result),
        })
    }

    /// Same contract as [`Limiter::consume`].
    pub async fn acquire(&self, request: &RateLimitRequest) -> Result<RateLimitResult> {
        self.consume(request).await
    }

    async fn decide(
        &self,
        request: &RateLimitRequest,
    ) -> (RateLimitResult, Option<Arc<CompiledRule>>, u64) {
        let matched = {
            let rules = self.rules.read();
            rules.find(request)
        };
        let Some(rule) = matched else {
            trace!(key = %request.key, "No rule matched, request is unlimited");
            let now = request.timestamp.unwrap_or_else(now_ms);
            return (RateLimitResult::unlimited(), None, now);
        };

        let state_key = StateKey::new(&request.key, rule.id());
        self.events.emit(LimiterEvent::RuleMatched {
            key: request.key.clone(),
            rule_id: rule.id().to_string(),
        });

        trace!(
            key = %request.key,
            rule = %rule.id(),
            algorithm = rule.rule.config.name(),
            cost = request.cost,
            "Checking rate limit"
        );

        let (result, now) = match self
            .evaluate(&rule.rule.config, &state_key, request.cost, request.timestamp)
            .await
        {
            Ok((decision, now)) => (RateLimitResult::from_decision(decision, rule.id()), now),
            Err(e) => (
                self.store_failure_result(&rule.rule.config, &state_key, &e),
                request.timestamp.unwrap_or_else(now_ms),
            ),
        };

        self.stats.record(&state_key, &result, now);

        if result.allowed {
            self.events.emit(LimiterEvent::Allowed {
                key: request.key.clone(),
                result: result.clone(),
            });
        } else {
            debug!(
                key = %request.key,
                rule = %rule.id(),
                retry_after_ms = ?result.retry_after_ms,
                "Rate limit exceeded"
            );
            self.events.emit(LimiterEvent::Rejected {
                key: request.key.clone(),
                result: result.clone(),
            });
        }

        if result.remaining == 0 {
            self.events.emit(LimiterEvent::LimitReached {
                key: request.key.clone(),
                rule_id: rule.id().to_string(),
                retry_after_ms: result.retry_after_ms,
            });
        }

        (result, Some(rule), now)
    }

    /// Read, transform and write one key's state under its lock.
    ///
    /// Without an explicit timestamp the clock is read once the lock is held,
    /// so writes to one key land in time order. Returns the decision and the
    /// time it was made at.
    async fn evaluate(
        &self,
        config: &AlgorithmConfig,
        state_key: &StateKey,
        cost: u64,
        timestamp: Option<u64>,
    ) -> Result<(Decision, u64)> {
        let storage_key = state_key.to_string_key();
        let _guard = self.locks.lock(&storage_key).await;
        let now = timestamp.unwrap_or_else(now_ms);

        let previous = self.store.get(&storage_key).await?;
        if previous.is_none() {
            debug!(key = %state_key, algorithm = config.name(), "Creating new limiter state");
        }

        let (state, decision) = algorithm::process(config, previous, cost, now);
        self.store
            .set(&storage_key, state, Some(config.state_ttl()))
            .await?;
        Ok((decision, now))
    }

    fn store_failure_result(
        &self,
        config: &AlgorithmConfig,
        state_key: &StateKey,
        error: &TurnstileError,
    ) -> RateLimitResult {
        warn!(
            key = %state_key,
            error = %error,
            policy = ?self.failure_policy,
            "State store failed, applying failure policy"
        );
        let limit = config.limit();
        let rule = Some(state_key.rule_id.clone());
        match self.failure_policy {
            FailurePolicy::Open => RateLimitResult {
                allowed: true,
                remaining: limit,
                limit,
                reset_ms: 0,
                retry_after_ms: None,
                rule,
                queue_position: None,
                queue_id: None,
            },
            FailurePolicy::Closed => RateLimitResult {
                allowed: false,
                remaining: 0,
                limit,
                reset_ms: 0,
                retry_after_ms: Some(0),
                rule,
                queue_position: None,
                queue_id: None,
            },
        }
    }

    fn try_queue(
        &self,
        request: &RateLimitRequest,
        rule: &CompiledRule,
        now: u64,
    ) -> Option<(usize, Uuid)> {
        if rule.rule.actions.on_limit != OnLimit::Queue {
            return None;
        }
        let Some(queue_config) = self.queue_config else {
            debug!(rule = %rule.id(), "Rule asks to queue but no queue is configured");
            return None;
        };

        let entry = QueuedRequest::new(request.clone(), now);
        let id = entry.id;
        match self
            .queue
            .try_enqueue(&request.key, entry, queue_config.max_size)
        {
            Some(position) => {
                self.stats
                    .record_queued(&StateKey::new(&request.key, rule.id()));
                self.events.emit(LimiterEvent::Queued {
                    key: request.key.clone(),
                    rule_id: rule.id().to_string(),
                    position,
                });
                debug!(key = %request.key, position = position, "Request queued");
                Some((position, id))
            }
            None => {
                debug!(
                    key = %request.key,
                    max_size = queue_config.max_size,
                    "Queue full, rejecting request"
                );
                None
            }
        }
    }

    /// Add a rule, replacing any rule with the same id.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        let id = rule.id.clone();
        let priority = rule.priority;
        self.rules.write().insert(rule)?;
        info!(limiter = %self.name, rule = %id, priority = priority, "Rule added");
        Ok(())
    }

    /// Remove a rule. Its persisted state expires on its own.
    pub fn remove_rule(&self, id: &str) -> bool {
        let removed = self.rules.write().remove(id);
        if removed {
            info!(limiter = %self.name, rule = %id, "Rule removed");
        }
        removed
    }

    pub fn get_rule(&self, id: &str) -> Option<RateLimitRule> {
        self.rules.read().get(id).cloned()
    }

    /// Rules in evaluation order, excluding the default rule.
    pub fn get_rules(&self) -> Vec<RateLimitRule> {
        self.rules.read().rules()
    }

    pub fn set_default_rule(&self, rule: Option<RateLimitRule>) -> Result<()> {
        self.rules.write().set_default(rule)
    }

    pub fn default_rule(&self) -> Option<RateLimitRule> {
        self.rules.read().default_rule().cloned()
    }

    pub fn get_stats(&self, key: Option<&str>) -> Vec<RateLimitStats> {
        self.stats.get(key)
    }

    pub fn reset_stats(&self, key: Option<&str>) {
        self.stats.reset(key);
    }

    fn rule_ids_for(&self, rule_id: Option<&str>) -> Vec<String> {
        match rule_id {
            Some(id) => vec![id.to_string()],
            None => self.rules.read().rule_ids(),
        }
    }

    /// Clear persisted state for `key` under one rule, or under every known
    /// rule when `rule_id` is `None`. Returns how many entries were removed.
    pub async fn reset(&self, key: &str, rule_id: Option<&str>) -> Result<usize> {
        let rule_ids = self.rule_ids_for(rule_id);

        let mut removed = 0;
        for rule_id in rule_ids {
            let storage_key = StateKey::new(key, &rule_id).to_string_key();
            let _guard = self.locks.lock(&storage_key).await;
            if self.store.delete(&storage_key).await? {
                removed += 1;
            }
        }

        info!(limiter = %self.name, key = %key, removed = removed, "Limiter state reset");
        Ok(removed)
    }

    /// Persisted state for `key` under one rule, or the first rule in
    /// evaluation order that has state when `rule_id` is `None`.
    pub async fn get_state(&self, key: &str, rule_id: Option<&str>) -> Result<Option<LimiterState>> {
        let rule_ids = self.rule_ids_for(rule_id);

        for rule_id in rule_ids {
            let storage_key = StateKey::new(key, &rule_id).to_string_key();
            if let Some(state) = self.store.get(&storage_key).await? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// Take a queued request back out of its queue without serving it.
    ///
    /// `result` is what [`Limiter::consume`] returned for the request. The
    /// request then counts as rejected. Returns `false` if it was not queued or
    /// has already been dequeued.
    pub fn withdraw(&self, key: &str, result: &RateLimitResult) -> bool {
        let (Some(id), Some(rule_id)) = (result.queue_id, result.rule.as_deref()) else {
            return false;
        };
        if self.queue.remove(key, id).is_none() {
            return false;
        }
        self.stats.record_withdrawn(&StateKey::new(key, rule_id));
        debug!(key = %key, rule = %rule_id, "Queued request withdrawn");
        true
    }

    /// Queued requests, for caller-driven draining.
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<LimiterEvent> {
        self.events.stream()
    }

    /// Stop background cleanup and detach event subscribers.
    ///
    /// The limiter keeps answering requests afterwards, without events.
    pub fn destroy(&self) {
        if let Some(task) = self.cleanup.lock().take() {
            task.token.cancel();
        }
        if !self.events.is_closed() {
            self.events.close();
            info!(limiter = %self.name, "Limiter destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.events.is_closed()
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.get_mut().take() {
            task.token.cancel();
            task.handle.abort();
        }
    }
}

/// Spawn the periodic state and stats sweep.
///
/// Returns `None` when cleanup is disabled or there is no runtime to run it on.
fn spawn_cleanup(
    name: &str,
    store: Arc<dyn StateStore>,
    stats: Arc<StatsTracker>,
    interval: Duration,
    retention: Duration,
) -> Option<CleanupTask> {
    if interval.is_zero() {
        return None;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!(limiter = %name, "No tokio runtime, background cleanup disabled");
        return None;
    };

    let token = CancellationToken::new();
    let task_token = token.clone();
    let limiter = name.to_string();
    let handle = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = store.sweep().await {
                        warn!(limiter = %limiter, error = %e, "State sweep failed");
                    }
                    stats.sweep(retention);
                }
            }
        }

        debug!(limiter = %limiter, "Cleanup task stopped");
    });

    Some(CleanupTask { token, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::RuleMatch;
    use async_trait::async_trait;
    use tokio::sync::broadcast::error::RecvError;
    use tokio_test::{assert_err, assert_ok};

    fn token_bucket() -> AlgorithmConfig {
        AlgorithmConfig::TokenBucket {
            capacity: 10,
            refill_rate: 5,
            refill_interval_ms: 1000,
        }
    }

    fn fixed_window(max_requests: u64) -> AlgorithmConfig {
        AlgorithmConfig::FixedWindow {
            window_ms: 60_000,
            max_requests,
        }
    }

    fn config_with(rules: Vec<RateLimitRule>) -> LimiterConfig {
        LimiterConfig {
            rules,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_token_bucket_scenario() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("tb", token_bucket())])).unwrap();

        let result = assert_ok!(limiter.consume(&RateLimitRequest::new("c").with_cost(10).at(0)).await);
        assert_eq!(result.remaining, 0);

        let err = assert_err!(limiter.consume(&RateLimitRequest::new("c").at(500)).await);
        match err {
            TurnstileError::RateLimitExceeded { key, result } => {
                assert_eq!(key, "c");
                assert!(!result.allowed);
                assert_eq!(result.retry_after_ms, Some(500));
                assert_eq!(result.rule.as_deref(), Some("tb"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let result = assert_ok!(limiter.acquire(&RateLimitRequest::new("c").with_cost(5).at(1000)).await);
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_scenario() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(5))])).unwrap();

        for expected in [4, 3, 2, 1, 0] {
            let result = limiter.check(&RateLimitRequest::new("c").at(0)).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
            assert_eq!(result.limit, 5);
        }

        let result = limiter.check(&RateLimitRequest::new("c").at(100)).await;
        assert!(!result.allowed);
        assert_eq!(result.reset_ms, 59_900);
        assert_eq!(result.retry_after_ms, Some(59_900));
    }

    #[tokio::test]
    async fn test_unmatched_request_is_unlimited() {
        let limiter = Limiter::new(LimiterConfig::default()).unwrap();

        let result = limiter.check(&RateLimitRequest::new("c").with_cost(1_000_000)).await;
        assert_eq!(result, RateLimitResult::unlimited());
        assert!(limiter.get_stats(None).is_empty());
    }

    #[tokio::test]
    async fn test_default_rule_applies_when_nothing_matches() {
        let limiter = Limiter::new(LimiterConfig {
            rules: vec![RateLimitRule::new("admin", fixed_window(100)).with_match(RuleMatch {
                path: Some("/admin/*".to_string()),
                ..Default::default()
            })],
            default_rule: Some(RateLimitRule::new("fallback", fixed_window(2))),
            ..Default::default()
        })
        .unwrap();

        let result = limiter
            .check(&RateLimitRequest::new("c").with_path("/public").at(0))
            .await;
        assert_eq!(result.rule.as_deref(), Some("fallback"));
        assert_eq!(result.limit, 2);

        let result = limiter
            .check(&RateLimitRequest::new("c").with_path("/admin/users").at(0))
            .await;
        assert_eq!(result.rule.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_higher_priority_rule_config_applies() {
        let limiter = Limiter::new(config_with(vec![
            RateLimitRule::new("low", fixed_window(50)).with_priority(5),
            RateLimitRule::new("high", fixed_window(3)).with_priority(10),
        ]))
        .unwrap();

        for _ in 0..3 {
            let result = limiter.check(&RateLimitRequest::new("c").at(0)).await;
            assert_eq!(result.rule.as_deref(), Some("high"));
            assert_eq!(result.limit, 3);
        }
        assert!(!limiter.check(&RateLimitRequest::new("c").at(0)).await.allowed);
    }

    #[tokio::test]
    async fn test_keys_have_independent_budgets() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(1))])).unwrap();

        assert!(limiter.check(&RateLimitRequest::new("a").at(0)).await.allowed);
        assert!(limiter.check(&RateLimitRequest::new("b").at(0)).await.allowed);
        assert!(!limiter.check(&RateLimitRequest::new("a").at(0)).await.allowed);
    }

    #[tokio::test]
    async fn test_out_of_order_timestamps_do_not_reopen_window() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(1))])).unwrap();

        assert!(limiter.check(&RateLimitRequest::new("c").at(60_000)).await.allowed);
        assert!(!limiter.check(&RateLimitRequest::new("c").at(59_999)).await.allowed);
        assert!(!limiter.check(&RateLimitRequest::new("c").at(60_001)).await.allowed);

        assert_eq!(
            limiter.get_state("c", Some("fw")).await.unwrap(),
            Some(LimiterState::FixedWindow {
                window_start: 60_000,
                count: 1
            })
        );
    }

    #[tokio::test]
    async fn test_queue_on_limit() {
        let limiter = Limiter::new(LimiterConfig {
            rules: vec![RateLimitRule::new("fw", fixed_window(1)).on_limit(OnLimit::Queue)],
            queue: Some(QueueConfig { max_size: 2 }),
            ..Default::default()
        })
        .unwrap();

        assert_ok!(limiter.consume(&RateLimitRequest::new("c").at(0)).await);

        let first = assert_ok!(limiter.consume(&RateLimitRequest::new("c").at(1)).await);
        assert!(!first.allowed);
        assert_eq!(first.queue_position, Some(1));

        let second = assert_ok!(limiter.consume(&RateLimitRequest::new("c").at(2)).await);
        assert_eq!(second.queue_position, Some(2));

        let err = assert_err!(limiter.consume(&RateLimitRequest::new("c").at(3)).await);
        assert!(err.rate_limit_result().unwrap().queue_position.is_none());

        let stats = limiter.get_stats(Some("c"));
        assert_eq!(stats[0].total, 4);
        assert_eq!(stats[0].queued, 2);
        assert_eq!(stats[0].rejected, 1);

        let head = limiter.queue().dequeue("c").unwrap();
        assert_eq!(head.request.timestamp, Some(1));
        assert_eq!(limiter.queue().size("c"), 1);

        assert!(!limiter.withdraw("c", &first));
        assert!(limiter.withdraw("c", &second));
        assert_eq!(limiter.queue().size("c"), 0);
        let stats = limiter.get_stats(Some("c"));
        assert_eq!(stats[0].queued, 1);
        assert_eq!(stats[0].rejected, 2);
    }

    #[tokio::test]
    async fn test_queue_policy_without_queue_config_rejects() {
        let limiter = Limiter::new(config_with(vec![
            RateLimitRule::new("fw", fixed_window(1)).on_limit(OnLimit::Queue),
        ]))
        .unwrap();

        assert_ok!(limiter.consume(&RateLimitRequest::new("c").at(0)).await);
        assert_err!(limiter.consume(&RateLimitRequest::new("c").at(0)).await);
        assert_eq!(limiter.queue().total_size(), 0);
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_order() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(1))])).unwrap();
        let mut events = limiter.subscribe();

        limiter.check(&RateLimitRequest::new("c").at(0)).await;
        limiter.check(&RateLimitRequest::new("c").at(0)).await;

        assert!(matches!(events.recv().await.unwrap(), LimiterEvent::RuleMatched { .. }));
        assert!(matches!(events.recv().await.unwrap(), LimiterEvent::Allowed { .. }));
        assert!(matches!(events.recv().await.unwrap(), LimiterEvent::LimitReached { .. }));
        assert!(matches!(events.recv().await.unwrap(), LimiterEvent::RuleMatched { .. }));
        assert!(matches!(events.recv().await.unwrap(), LimiterEvent::Rejected { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            LimiterEvent::LimitReached { retry_after_ms: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_reset_unblocks_key() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(1))])).unwrap();

        assert!(limiter.check(&RateLimitRequest::new("c").at(0)).await.allowed);
        assert!(!limiter.check(&RateLimitRequest::new("c").at(0)).await.allowed);
        assert!(limiter.get_state("c", None).await.unwrap().is_some());

        assert_eq!(limiter.reset("c", None).await.unwrap(), 1);
        assert_eq!(limiter.get_state("c", Some("fw")).await.unwrap(), None);
        assert!(limiter.check(&RateLimitRequest::new("c").at(0)).await.allowed);
    }

    #[tokio::test]
    async fn test_get_state_reflects_last_decision() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(5))])).unwrap();
        limiter.check(&RateLimitRequest::new("c").with_cost(3).at(61_000)).await;

        let state = limiter.get_state("c", Some("fw")).await.unwrap();
        assert_eq!(
            state,
            Some(LimiterState::FixedWindow {
                window_start: 60_000,
                count: 3
            })
        );
    }

    #[tokio::test]
    async fn test_rule_crud() {
        let limiter = Limiter::new(LimiterConfig::default()).unwrap();

        limiter.add_rule(RateLimitRule::new("a", fixed_window(1)).with_priority(1)).unwrap();
        limiter.add_rule(RateLimitRule::new("b", fixed_window(1)).with_priority(2)).unwrap();
        let ids: Vec<String> = limiter.get_rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "a"]);

        assert!(limiter.add_rule(RateLimitRule::new("bad", fixed_window(0))).is_err());
        assert_eq!(limiter.get_rules().len(), 2);

        assert!(limiter.remove_rule("b"));
        assert!(!limiter.remove_rule("b"));
        assert!(limiter.get_rule("b").is_none());
        assert_eq!(limiter.get_rule("a").unwrap().priority, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_construction() {
        let err = Limiter::new(config_with(vec![RateLimitRule::new("bad", AlgorithmConfig::TokenBucket {
            capacity: 0,
            refill_rate: 1,
            refill_interval_ms: 1,
        })]))
        .unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidRule { .. }));
    }

    #[tokio::test]
    async fn test_stats_and_reset_stats() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(2))])).unwrap();
        for t in 0..3 {
            limiter.check(&RateLimitRequest::new("c").at(t)).await;
        }
        limiter.check(&RateLimitRequest::new("d").at(0)).await;

        let stats = limiter.get_stats(Some("c"));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total, 3);
        assert_eq!(stats[0].allowed, 2);
        assert_eq!(stats[0].rejected, 1);
        assert_eq!(stats[0].peak_usage, 1.0);
        assert_eq!(stats[0].last_request, 2);

        limiter.reset_stats(Some("c"));
        assert!(limiter.get_stats(Some("c")).is_empty());
        assert_eq!(limiter.get_stats(None).len(), 1);
    }

    struct FailingStore;

    #[async_trait]
    impl StateStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<LimiterState>> {
            Err(TurnstileError::Store("unavailable".to_string()))
        }

        async fn set(&self, _key: &str, _state: LimiterState, _ttl: Option<Duration>) -> Result<()> {
            Err(TurnstileError::Store("unavailable".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(TurnstileError::Store("unavailable".to_string()))
        }

        fn store_type(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_store_failure_policy() {
        let open = Limiter::with_store(
            "open",
            config_with(vec![RateLimitRule::new("fw", fixed_window(5))]),
            Arc::new(FailingStore),
        )
        .unwrap();
        let result = open.check(&RateLimitRequest::new("c")).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 5);

        let closed = Limiter::with_store(
            "closed",
            LimiterConfig {
                rules: vec![RateLimitRule::new("fw", fixed_window(5))],
                store_failure: FailurePolicy::Closed,
                ..Default::default()
            },
            Arc::new(FailingStore),
        )
        .unwrap();
        let result = closed.check(&RateLimitRequest::new("c")).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert!(closed.reset("c", None).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_detaches_subscribers() {
        let limiter = Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(5))])).unwrap();
        let mut events = limiter.subscribe();

        limiter.destroy();
        limiter.destroy();
        assert!(limiter.is_destroyed());
        assert!(matches!(events.recv().await, Err(RecvError::Closed)));

        // Decisions keep working after destroy.
        assert!(limiter.check(&RateLimitRequest::new("c").at(0)).await.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_overspend() {
        let limiter = Arc::new(
            Limiter::new(config_with(vec![RateLimitRule::new("fw", fixed_window(10))])).unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check(&RateLimitRequest::new("shared").at(0)).await.allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_background_cleanup_sweeps_expired_state() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Limiter::with_store(
            "sweeper",
            LimiterConfig {
                rules: vec![RateLimitRule::new(
                    "short",
                    AlgorithmConfig::FixedWindow {
                        window_ms: 25,
                        max_requests: 1,
                    },
                )],
                cleanup_interval_ms: 10,
                ..Default::default()
            },
            store.clone(),
        )
        .unwrap();

        limiter.check(&RateLimitRequest::new("c")).await;
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.len(), 0);

        limiter.destroy();
    }

    #[test]
    fn test_limiter_without_runtime_skips_cleanup() {
        let limiter = Limiter::new(LimiterConfig::default()).unwrap();
        assert!(limiter.cleanup.lock().is_none());
    }
}
