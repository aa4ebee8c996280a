//! Limiter lifecycle events.
//!
//! Events are published on a broadcast channel. Publishing never blocks the
//! decision path; a subscriber that falls behind sees `Lagged` and skips ahead.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::request::RateLimitResult;

/// Capacity of the event channel before slow subscribers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LimiterEvent {
    RuleMatched {
        key: String,
        rule_id: String,
    },
    Allowed {
        key: String,
        result: RateLimitResult,
    },
    Rejected {
        key: String,
        result: RateLimitResult,
    },
    /// The budget is exhausted after this decision
    LimitReached {
        key: String,
        rule_id: String,
        retry_after_ms: Option<u64>,
    },
    Queued {
        key: String,
        rule_id: String,
        position: usize,
    },
}

/// Sender side of the event channel; dropped on close so subscribers see the end.
#[derive(Debug)]
pub struct EventBus {
    sender: parking_lot::Mutex<Option<broadcast::Sender<LimiterEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender: parking_lot::Mutex::new(Some(sender)),
        }
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: LimiterEvent) {
        if let Some(ref sender) = *self.sender.lock() {
            let _ = sender.send(event);
        }
    }

    /// Subscribe to future events. After [`EventBus::close`] the receiver is
    /// already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        match *self.sender.lock() {
            Some(ref sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn stream(&self) -> BroadcastStream<LimiterEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Detach all subscribers.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
