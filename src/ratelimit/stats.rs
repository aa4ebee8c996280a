//! Usage statistics per (key, rule).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use super::request::{RateLimitResult, StateKey};

/// Counters for one (key, rule) pair.
///
/// Every decision lands in exactly one bucket, so
/// `total == allowed + rejected + queued`. A denied request that was queued
/// counts as queued, not rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub key: String,
    pub rule_id: String,
    pub total: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub queued: u64,
    /// Highest observed `1 - remaining / limit`
    pub peak_usage: f64,
    /// Timestamp of the most recent request, epoch milliseconds
    pub last_request: u64,
}

impl RateLimitStats {
    fn new(key: &StateKey) -> Self {
        Self {
            key: key.key.clone(),
            rule_id: key.rule_id.clone(),
            total: 0,
            allowed: 0,
            rejected: 0,
            queued: 0,
            peak_usage: 0.0,
            last_request: 0,
        }
    }
}

#[derive(Debug)]
struct StatsEntry {
    stats: RateLimitStats,
    touched: Instant,
}

/// Concurrent statistics table.
///
/// Retention is measured on the monotonic clock from the last recorded request,
/// independent of the timestamps carried by requests.
#[derive(Debug, Default)]
pub struct StatsTracker {
    entries: DashMap<StateKey, StatsEntry>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decision.
    pub fn record(&self, key: &StateKey, result: &RateLimitResult, timestamp: u64) {
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| StatsEntry {
                stats: RateLimitStats::new(key),
                touched: Instant::now(),
            });
        let entry = entry.value_mut();
        entry.touched = Instant::now();

        let stats = &mut entry.stats;
        stats.total += 1;
        if result.allowed {
            stats.allowed += 1;
        } else {
            stats.rejected += 1;
        }
        stats.peak_usage = stats.peak_usage.max(result.usage());
        stats.last_request = stats.last_request.max(timestamp);
    }

    /// Move a recorded denial into the queued bucket.
    pub fn record_queued(&self, key: &StateKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            let stats = &mut entry.stats;
            stats.rejected = stats.rejected.saturating_sub(1);
            stats.queued += 1;
        }
    }

    /// Move a queued request back to rejected after it left the queue unserved.
    pub fn record_withdrawn(&self, key: &StateKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            let stats = &mut entry.stats;
            stats.queued = stats.queued.saturating_sub(1);
            stats.rejected += 1;
        }
    }

    /// Stats for one request key across all rules, or everything when `None`.
    ///
    /// Sorted by key, then rule id.
    pub fn get(&self, key: Option<&str>) -> Vec<RateLimitStats> {
        let mut stats: Vec<RateLimitStats> = self
            .entries
            .iter()
            .filter(|entry| key.map_or(true, |k| entry.key().key == k))
            .map(|entry| entry.stats.clone())
            .collect();
        stats.sort_by(|a, b| (&a.key, &a.rule_id).cmp(&(&b.key, &b.rule_id)));
        stats
    }

    pub fn reset(&self, key: Option<&str>) {
        match key {
            Some(k) => self.entries.retain(|state_key, _| state_key.key != k),
            None => self.entries.clear(),
        }
    }

    /// Drop entries not touched within `retention`. Returns how many were removed.
    pub fn sweep(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.touched) < retention);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed = removed, "Swept stale limiter stats");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
