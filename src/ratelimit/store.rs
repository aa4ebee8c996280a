//! Limiter state storage.
//!
//! The [`StateStore`] trait is asynchronous so that a network-backed store can
//! be plugged in. The limiter serializes access per state key itself, so a
//! store only needs to make individual operations atomic.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::algorithm::LimiterState;
use crate::error::Result;

/// Trait for limiter state backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the state for `key`. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<LimiterState>>;

    /// Store `state` under `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, state: LimiterState, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Returns `true` if a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<LimiterState>>> {
        let mut states = Vec::with_capacity(keys.len());
        for key in keys {
            states.push(self.get(key).await?);
        }
        Ok(states)
    }

    async fn set_many(
        &self,
        entries: Vec<(String, LimiterState)>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        for (key, state) in entries {
            self.set(&key, state, ttl).await?;
        }
        Ok(())
    }

    /// Remove several keys, returning how many live entries were removed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop expired entries, returning how many were removed.
    async fn sweep(&self) -> Result<usize> {
        Ok(0)
    }

    /// Store type name for logging.
    fn store_type(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct StoredState {
    state: LimiterState,
    expires_at: Option<Instant>,
}

impl StoredState {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process state store backed by a concurrent hash map.
///
/// Expiry is measured on the monotonic clock at write time and applied lazily
/// on reads as well as by [`StateStore::sweep`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<LimiterState>> {
        let now = Instant::now();
        if self
            .entries
            .remove_if(key, |_, stored| stored.is_expired(now))
            .is_some()
        {
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|stored| stored.state.clone()))
    }

    async fn set(&self, key: &str, state: LimiterState, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .insert(key.to_string(), StoredState { state, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| !stored.is_expired(now)))
    }

    async fn sweep(&self) -> Result<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed = removed, "Swept expired limiter state");
        }
        Ok(removed)
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
