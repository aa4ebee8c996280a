//! Turnstile - Admission Control Engine
//!
//! This crate decides, per request, whether work is allowed, rejected, or
//! queued against a configurable budget. Budgets are enforced with token
//! bucket, sliding window, fixed window, or leaky bucket algorithms, selected
//! by priority-ordered rules matched against request attributes.

pub mod config;
pub mod error;
pub mod ratelimit;
