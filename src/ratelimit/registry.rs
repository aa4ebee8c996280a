//! Named, isolated limiter instances.
//!
//! A registry is an ordinary value passed to whoever needs it. Limiters in it
//! share no state, so one subsystem cannot exhaust another's budget.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::limiter::Limiter;
use crate::config::LimiterConfig;
use crate::error::{Result, TurnstileError};

#[derive(Debug, Default)]
pub struct Registry {
    limiters: RwLock<HashMap<String, Arc<Limiter>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a limiter. Fails if `name` is taken.
    pub fn create(&self, name: &str, config: LimiterConfig) -> Result<Arc<Limiter>> {
        let mut limiters = self.limiters.write();
        if limiters.contains_key(name) {
            return Err(TurnstileError::LimiterExists(name.to_string()));
        }
        let limiter = Arc::new(Limiter::named(name, config)?);
        limiters.insert(name.to_string(), limiter.clone());
        info!(limiter = %name, "Limiter registered");
        Ok(limiter)
    }

    /// Return the limiter named `name`, creating it from `config` if absent.
    ///
    /// `config` is ignored when the limiter already exists.
    pub fn get_or_create(&self, name: &str, config: LimiterConfig) -> Result<Arc<Limiter>> {
        if let Some(limiter) = self.get(name) {
            return Ok(limiter);
        }
        let mut limiters = self.limiters.write();
        if let Some(limiter) = limiters.get(name) {
            return Ok(limiter.clone());
        }
        let limiter = Arc::new(Limiter::named(name, config)?);
        limiters.insert(name.to_string(), limiter.clone());
        info!(limiter = %name, "Limiter registered");
        Ok(limiter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Limiter>> {
        self.limiters.read().get(name).cloned()
    }

    /// Destroy and unregister a limiter. Returns `true` if it existed.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.limiters.write().remove(name);
        match removed {
            Some(limiter) => {
                limiter.destroy();
                info!(limiter = %name, "Limiter removed");
                true
            }
            None => false,
        }
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }

    /// Destroy and unregister every limiter.
    pub fn destroy_all(&self) {
        let drained: Vec<Arc<Limiter>> = self.limiters.write().drain().map(|(_, l)| l).collect();
        for limiter in drained {
            limiter.destroy();
        }
    }
}
