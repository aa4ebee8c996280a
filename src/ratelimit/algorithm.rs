//! Rate limiting algorithms.
//!
//! Every algorithm is a pure transition from `(previous state, config, cost, now)`
//! to `(new state, decision)`. Nothing in this module reads a clock or touches a
//! store, so the same inputs always produce the same outputs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one of the supported limiting algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// Tokens accrue at `refill_rate` per `refill_interval_ms`, up to `capacity`.
    TokenBucket {
        capacity: u64,
        refill_rate: u64,
        refill_interval_ms: u64,
    },
    /// Window split into `precision` sub-windows whose counts decay linearly with age.
    SlidingWindow {
        window_ms: u64,
        max_requests: u64,
        #[serde(default = "default_precision")]
        precision: u64,
    },
    /// Counter reset at every aligned `window_ms` boundary.
    FixedWindow { window_ms: u64, max_requests: u64 },
    /// Level drains by `leak_rate` every `leak_interval_ms`; requests add to it.
    LeakyBucket {
        capacity: u64,
        leak_rate: u64,
        leak_interval_ms: u64,
    },
}

fn default_precision() -> u64 {
    10
}

impl AlgorithmConfig {
    /// Short algorithm tag, as used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmConfig::TokenBucket { .. } => "token_bucket",
            AlgorithmConfig::SlidingWindow { .. } => "sliding_window",
            AlgorithmConfig::FixedWindow { .. } => "fixed_window",
            AlgorithmConfig::LeakyBucket { .. } => "leaky_bucket",
        }
    }

    /// The budget reported as `limit` in every result.
    pub fn limit(&self) -> u64 {
        match *self {
            AlgorithmConfig::TokenBucket { capacity, .. } => capacity,
            AlgorithmConfig::SlidingWindow { max_requests, .. } => max_requests,
            AlgorithmConfig::FixedWindow { max_requests, .. } => max_requests,
            AlgorithmConfig::LeakyBucket { capacity, .. } => capacity,
        }
    }

    /// Check the configuration for values that would make the algorithm meaningless.
    ///
    /// Returns a human readable reason on failure.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            AlgorithmConfig::TokenBucket {
                capacity,
                refill_rate,
                refill_interval_ms,
            } => {
                non_zero("capacity", capacity)?;
                non_zero("refill_rate", refill_rate)?;
                non_zero("refill_interval_ms", refill_interval_ms)
            }
            AlgorithmConfig::SlidingWindow {
                window_ms,
                max_requests,
                precision,
            } => {
                non_zero("window_ms", window_ms)?;
                non_zero("max_requests", max_requests)?;
                non_zero("precision", precision)?;
                if precision > window_ms {
                    return Err(format!(
                        "precision ({}) must not exceed window_ms ({})",
                        precision, window_ms
                    ));
                }
                Ok(())
            }
            AlgorithmConfig::FixedWindow {
                window_ms,
                max_requests,
            } => {
                non_zero("window_ms", window_ms)?;
                non_zero("max_requests", max_requests)
            }
            AlgorithmConfig::LeakyBucket {
                capacity,
                leak_rate,
                leak_interval_ms,
            } => {
                non_zero("capacity", capacity)?;
                non_zero("leak_rate", leak_rate)?;
                non_zero("leak_interval_ms", leak_interval_ms)
            }
        }
    }

    /// How long persisted state stays useful: twice the natural recovery time.
    pub fn state_ttl(&self) -> Duration {
        let recovery_ms = match *self {
            AlgorithmConfig::TokenBucket {
                capacity,
                refill_rate,
                refill_interval_ms,
            } => ceil_div(capacity, refill_rate).saturating_mul(refill_interval_ms),
            AlgorithmConfig::SlidingWindow { window_ms, .. } => window_ms,
            AlgorithmConfig::FixedWindow { window_ms, .. } => window_ms,
            AlgorithmConfig::LeakyBucket {
                capacity,
                leak_rate,
                leak_interval_ms,
            } => ceil_div(capacity, leak_rate).saturating_mul(leak_interval_ms),
        };
        Duration::from_millis(recovery_ms.saturating_mul(2))
    }
}

fn non_zero(field: &str, value: u64) -> std::result::Result<(), String> {
    if value == 0 {
        Err(format!("{} must be greater than 0", field))
    } else {
        Ok(())
    }
}

/// One sub-window of a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWindow {
    /// Aligned start of the sub-window in epoch milliseconds
    pub start: u64,
    /// Units admitted during this sub-window
    pub count: u64,
}

/// Persisted per-(key, rule) state, one variant per algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterState {
    TokenBucket { tokens: u64, last_refill: u64 },
    SlidingWindow { windows: Vec<SubWindow> },
    FixedWindow { window_start: u64, count: u64 },
    LeakyBucket { level: u64, last_leak: u64 },
}

/// Outcome of a single algorithm step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub reset_ms: u64,
    pub retry_after_ms: Option<u64>,
}

/// Run one admission step for `cost` units at time `now` (epoch milliseconds).
///
/// A `previous` state belonging to a different algorithm is ignored and the
/// algorithm starts fresh.
pub fn process(
    config: &AlgorithmConfig,
    previous: Option<LimiterState>,
    cost: u64,
    now: u64,
) -> (LimiterState, Decision) {
    match *config {
        AlgorithmConfig::TokenBucket {
            capacity,
            refill_rate,
            refill_interval_ms,
        } => {
            let previous = match previous {
                Some(LimiterState::TokenBucket {
                    tokens,
                    last_refill,
                }) => Some((tokens, last_refill)),
                _ => None,
            };
            token_bucket(capacity, refill_rate, refill_interval_ms, previous, cost, now)
        }
        AlgorithmConfig::SlidingWindow {
            window_ms,
            max_requests,
            precision,
        } => {
            let previous = match previous {
                Some(LimiterState::SlidingWindow { windows }) => windows,
                _ => Vec::new(),
            };
            sliding_window(window_ms, max_requests, precision, previous, cost, now)
        }
        AlgorithmConfig::FixedWindow {
            window_ms,
            max_requests,
        } => {
            let previous = match previous {
                Some(LimiterState::FixedWindow {
                    window_start,
                    count,
                }) => Some((window_start, count)),
                _ => None,
            };
            fixed_window(window_ms, max_requests, previous, cost, now)
        }
        AlgorithmConfig::LeakyBucket {
            capacity,
            leak_rate,
            leak_interval_ms,
        } => {
            let previous = match previous {
                Some(LimiterState::LeakyBucket { level, last_leak }) => Some((level, last_leak)),
                _ => None,
            };
            leaky_bucket(capacity, leak_rate, leak_interval_ms, previous, cost, now)
        }
    }
}

fn ceil_div(value: u64, divisor: u64) -> u64 {
    value / divisor + u64::from(value % divisor != 0)
}

/// Milliseconds from `now` until `units` more units have been produced by a
/// process that yields `rate` units every `interval` ms, counting from `anchor`.
fn time_until_units(units: u64, rate: u64, interval: u64, anchor: u64, now: u64) -> u64 {
    if units == 0 {
        return 0;
    }
    let intervals = ceil_div(units, rate);
    anchor
        .saturating_add(intervals.saturating_mul(interval))
        .saturating_sub(now)
}

fn token_bucket(
    capacity: u64,
    refill_rate: u64,
    refill_interval_ms: u64,
    previous: Option<(u64, u64)>,
    cost: u64,
    now: u64,
) -> (LimiterState, Decision) {
    let (tokens, mut last_refill) = previous.unwrap_or((capacity, now));

    let elapsed = now.saturating_sub(last_refill);
    let intervals = elapsed / refill_interval_ms;
    let added = intervals.saturating_mul(refill_rate);
    // Only move the refill anchor by whole intervals so partial progress is kept.
    if added > 0 {
        last_refill = last_refill.saturating_add(intervals.saturating_mul(refill_interval_ms));
    }
    let available = tokens.saturating_add(added).min(capacity);

    let allowed = available >= cost;
    let remaining = if allowed { available - cost } else { available };

    let reset_ms = time_until_units(
        capacity - remaining,
        refill_rate,
        refill_interval_ms,
        last_refill,
        now,
    );
    let retry_after_ms = (!allowed).then(|| {
        time_until_units(
            cost - available,
            refill_rate,
            refill_interval_ms,
            last_refill,
            now,
        )
    });

    (
        LimiterState::TokenBucket {
            tokens: remaining,
            last_refill,
        },
        Decision {
            allowed,
            remaining,
            limit: capacity,
            reset_ms,
            retry_after_ms,
        },
    )
}

/// Sum of sub-window counts, each weighted by `1 - age / window_ms`.
fn weighted_count(windows: &[SubWindow], window_ms: u64, now: u64) -> f64 {
    windows
        .iter()
        .map(|w| {
            let age = now.saturating_sub(w.start) as f64;
            let weight = (1.0 - age / window_ms as f64).clamp(0.0, 1.0);
            w.count as f64 * weight
        })
        .sum()
}

fn sliding_window(
    window_ms: u64,
    max_requests: u64,
    precision: u64,
    previous: Vec<SubWindow>,
    cost: u64,
    now: u64,
) -> (LimiterState, Decision) {
    let sub_window_ms = (window_ms / precision).max(1);
    let horizon = now.saturating_sub(window_ms);

    let mut windows: Vec<SubWindow> = previous
        .into_iter()
        .filter(|w| w.start >= horizon)
        .collect();

    let current = weighted_count(&windows, window_ms, now);
    let allowed = current + cost as f64 <= max_requests as f64;

    if allowed {
        let start = now / sub_window_ms * sub_window_ms;
        match windows.iter_mut().find(|w| w.start == start) {
            Some(window) => window.count = window.count.saturating_add(cost),
            None => windows.push(SubWindow { start, count: cost }),
        }
        windows.sort_by_key(|w| w.start);
    }

    let used = if allowed {
        current + cost as f64
    } else {
        current
    };
    let remaining = ((max_requests as f64 - used).max(0.0).floor() as u64).min(max_requests);

    let reset_ms = windows
        .iter()
        .map(|w| w.start)
        .min()
        .map(|oldest| oldest.saturating_add(window_ms).saturating_sub(now))
        .unwrap_or(0);
    let retry_after_ms = (!allowed).then_some(reset_ms);

    (
        LimiterState::SlidingWindow { windows },
        Decision {
            allowed,
            remaining,
            limit: max_requests,
            reset_ms,
            retry_after_ms,
        },
    )
}

/// The hard reset at each boundary allows up to twice `max_requests` across
/// two adjacent windows. That burst is inherent to the algorithm.
fn fixed_window(
    window_ms: u64,
    max_requests: u64,
    previous: Option<(u64, u64)>,
    cost: u64,
    now: u64,
) -> (LimiterState, Decision) {
    let current = now / window_ms * window_ms;
    // A request stamped before the stored window counts against that window.
    let (window_start, count) = match previous {
        Some((start, count)) if start >= current => (start, count),
        _ => (current, 0),
    };

    let allowed = count.saturating_add(cost) <= max_requests;
    let count = if allowed { count + cost } else { count };
    let remaining = max_requests.saturating_sub(count);

    let reset_ms = window_start.saturating_add(window_ms).saturating_sub(now);
    let retry_after_ms = (!allowed).then_some(reset_ms);

    (
        LimiterState::FixedWindow {
            window_start,
            count,
        },
        Decision {
            allowed,
            remaining,
            limit: max_requests,
            reset_ms,
            retry_after_ms,
        },
    )
}

fn leaky_bucket(
    capacity: u64,
    leak_rate: u64,
    leak_interval_ms: u64,
    previous: Option<(u64, u64)>,
    cost: u64,
    now: u64,
) -> (LimiterState, Decision) {
    let (level, mut last_leak) = previous.unwrap_or((0, now));

    let elapsed = now.saturating_sub(last_leak);
    let intervals = elapsed / leak_interval_ms;
    let leaked = intervals.saturating_mul(leak_rate);
    if intervals > 0 {
        last_leak = last_leak.saturating_add(intervals.saturating_mul(leak_interval_ms));
    }
    let level = level.saturating_sub(leaked).min(capacity);

    let allowed = level.saturating_add(cost) <= capacity;
    let level = if allowed { level + cost } else { level };
    let remaining = capacity - level;

    let reset_ms = time_until_units(level, leak_rate, leak_interval_ms, last_leak, now);
    let retry_after_ms = (!allowed).then(|| {
        time_until_units(
            level.saturating_add(cost) - capacity,
            leak_rate,
            leak_interval_ms,
            last_leak,
            now,
        )
    });

    (
        LimiterState::LeakyBucket { level, last_leak },
        Decision {
            allowed,
            remaining,
            limit: capacity,
            reset_ms,
            retry_after_ms,
        },
    )
}
