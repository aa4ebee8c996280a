//! Named algorithm configurations for common cases.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::algorithm::AlgorithmConfig;
use crate::error::TurnstileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// 100 request burst, 10 per second sustained
    Api,
    /// 50 request burst that refills quickly, 25 per second
    Burst,
    /// 10 requests per minute, hard window
    Strict,
    /// Queue depth of 10, drained at 1 per second
    Smooth,
}

impl Preset {
    pub const ALL: [Preset; 4] = [Preset::Api, Preset::Burst, Preset::Strict, Preset::Smooth];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Api => "api",
            Preset::Burst => "burst",
            Preset::Strict => "strict",
            Preset::Smooth => "smooth",
        }
    }

    pub fn config(&self) -> AlgorithmConfig {
        match self {
            Preset::Api => AlgorithmConfig::TokenBucket {
                capacity: 100,
                refill_rate: 10,
                refill_interval_ms: 1000,
            },
            Preset::Burst => AlgorithmConfig::TokenBucket {
                capacity: 50,
                refill_rate: 5,
                refill_interval_ms: 200,
            },
            Preset::Strict => AlgorithmConfig::FixedWindow {
                window_ms: 60_000,
                max_requests: 10,
            },
            Preset::Smooth => AlgorithmConfig::LeakyBucket {
                capacity: 10,
                leak_rate: 1,
                leak_interval_ms: 1000,
            },
        }
    }
}

impl FromStr for Preset {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TurnstileError::Config(format!("Unknown preset '{}'", s)))
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
