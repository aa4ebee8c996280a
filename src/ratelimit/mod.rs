//! Rate limiting algorithms, rule matching and state management.

mod algorithm;
mod events;
mod guard;
mod limiter;
mod presets;
mod queue;
mod registry;
mod request;
mod rules;
mod stats;
mod store;

pub use algorithm::{process, AlgorithmConfig, Decision, LimiterState, SubWindow};
pub use events::{EventBus, LimiterEvent, EVENT_CHANNEL_CAPACITY};
pub use guard::with_rate_limit;
pub use limiter::{now_ms, Limiter, DEFAULT_LIMITER_NAME};
pub use presets::Preset;
pub use queue::{QueueConfig, QueueManager, QueuedRequest};
pub use registry::Registry;
pub use request::{RateLimitRequest, RateLimitResult, StateKey, KEY_SEPARATOR};
pub use rules::{CompiledRule, OnLimit, RateLimitRule, RuleActions, RuleMatch, RuleSet};
pub use stats::{RateLimitStats, StatsTracker};
pub use store::{MemoryStore, StateStore};
