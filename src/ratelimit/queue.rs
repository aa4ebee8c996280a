//! Per-key FIFO queues for requests whose rule asks to queue on limit.
//!
//! Entries never expire on their own. Draining is up to the caller, typically
//! by polling [`QueueManager::dequeue`] once `retry_after_ms` has elapsed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use super::request::RateLimitRequest;

/// Queue limits for a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum entries per key; a request that would land beyond it is rejected
    pub max_size: usize,
}

/// A request waiting for budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub request: RateLimitRequest,
    /// Epoch milliseconds at which the request was queued
    pub enqueued_at: u64,
}

impl QueuedRequest {
    pub fn new(request: RateLimitRequest, enqueued_at: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            enqueued_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueManager {
    queues: Mutex<HashMap<String, VecDeque<QueuedRequest>>>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its 1-based position.
    pub fn enqueue(&self, key: &str, entry: QueuedRequest) -> usize {
        let mut queues = self.queues.lock();
        let queue = queues.entry(key.to_string()).or_default();
        queue.push_back(entry);
        queue.len()
    }

    /// Append an entry only if its position would not exceed `max_size`.
    ///
    /// Returns the 1-based position, or `None` if the queue is full.
    pub fn try_enqueue(&self, key: &str, entry: QueuedRequest, max_size: usize) -> Option<usize> {
        let mut queues = self.queues.lock();
        if queues.get(key).map_or(0, VecDeque::len) >= max_size {
            return None;
        }
        let queue = queues.entry(key.to_string()).or_default();
        queue.push_back(entry);
        Some(queue.len())
    }

    /// Pop the oldest entry for `key`.
    pub fn dequeue(&self, key: &str) -> Option<QueuedRequest> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            queues.remove(key);
        }
        entry
    }

    /// Remove the entry with `id` from `key`'s queue, wherever it sits.
    pub fn remove(&self, key: &str, id: Uuid) -> Option<QueuedRequest> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(key)?;
        let index = queue.iter().position(|entry| entry.id == id)?;
        let entry = queue.remove(index);
        if queue.is_empty() {
            queues.remove(key);
        }
        entry
    }

    pub fn peek(&self, key: &str) -> Option<QueuedRequest> {
        self.queues
            .lock()
            .get(key)
            .and_then(|queue| queue.front().cloned())
    }

    pub fn size(&self, key: &str) -> usize {
        self.queues.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Entries across all keys.
    pub fn total_size(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    /// Clear one key's queue, or every queue when `key` is `None`.
    ///
    /// Returns the number of entries dropped.
    pub fn clear(&self, key: Option<&str>) -> usize {
        let mut queues = self.queues.lock();
        match key {
            Some(key) => queues.remove(key).map_or(0, |queue| queue.len()),
            None => queues.drain().map(|(_, queue)| queue.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, at: u64) -> QueuedRequest {
        QueuedRequest::new(RateLimitRequest::new(key), at)
    }

    #[test]
    fn test_fifo_order_and_positions() {
        let queue = QueueManager::new();
        assert_eq!(queue.enqueue("a", entry("a", 1)), 1);
        assert_eq!(queue.enqueue("a", entry("a", 2)), 2);
        assert_eq!(queue.enqueue("b", entry("b", 3)), 1);

        assert_eq!(queue.peek("a").unwrap().enqueued_at, 1);
        assert_eq!(queue.dequeue("a").unwrap().enqueued_at, 1);
        assert_eq!(queue.dequeue("a").unwrap().enqueued_at, 2);
        assert!(queue.dequeue("a").is_none());
        assert_eq!(queue.size("b"), 1);
    }

    #[test]
    fn test_try_enqueue_respects_max_size() {
        let queue = QueueManager::new();
        assert_eq!(queue.try_enqueue("a", entry("a", 1), 2), Some(1));
        assert_eq!(queue.try_enqueue("a", entry("a", 2), 2), Some(2));
        assert_eq!(queue.try_enqueue("a", entry("a", 3), 2), None);
        assert_eq!(queue.size("a"), 2);

        assert_eq!(queue.try_enqueue("z", entry("z", 1), 0), None);
        assert_eq!(queue.total_size(), 2);
    }

    #[test]
    fn test_remove_by_id() {
        let queue = QueueManager::new();
        let first = entry("a", 1);
        let second = entry("a", 2);
        let second_id = second.id;
        queue.enqueue("a", first);
        queue.enqueue("a", second);

        assert!(queue.remove("b", second_id).is_none());
        assert_eq!(queue.remove("a", second_id).unwrap().enqueued_at, 2);
        assert!(queue.remove("a", second_id).is_none());
        assert_eq!(queue.size("a"), 1);
        assert_eq!(queue.dequeue("a").unwrap().enqueued_at, 1);
        assert_eq!(queue.total_size(), 0);
    }

    #[test]
    fn test_clear() {
        let queue = QueueManager::new();
        queue.enqueue("a", entry("a", 1));
        queue.enqueue("a", entry("a", 2));
        queue.enqueue("b", entry("b", 3));

        assert_eq!(queue.clear(Some("a")), 2);
        assert_eq!(queue.clear(Some("a")), 0);
        assert_eq!(queue.clear(None), 1);
        assert_eq!(queue.total_size(), 0);
    }
}
