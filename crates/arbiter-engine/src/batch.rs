//! Batcher: groups rapid-fire observations into one decision cycle.
//!
//! The head of the queue is popped, then any queued observation within the
//! time window that shares its path or its category joins the batch, up to
//! the configured size. Critical heads only pull in other critical items and
//! non-critical heads never pull in critical ones, so batching cannot delay
//! or reorder critical work. Noise is never batched.

use arbiter_core::config::BatchConfig;
use arbiter_core::{Observation, Urgency};

use crate::queue::ObservationQueue;

#[derive(Debug, Clone)]
pub struct Batcher {
    window_ms: i64,
    max_batch_size: usize,
}

impl Batcher {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            window_ms: config.window_ms as i64,
            max_batch_size: config.max_batch_size.max(1),
        }
    }

    /// Pop the next batch. Never empty when `Some`; the first element is the
    /// observation `get_next` would have returned.
    pub fn next_batch(&self, queue: &mut ObservationQueue) -> Option<Vec<Observation>> {
        let head = queue.get_next()?;
        if head.urgency == Urgency::Noise {
            return Some(vec![head]);
        }

        let mut batch = queue.drain_where(self.max_batch_size - 1, |o| self.groups_with(&head, o));
        batch.insert(0, head);
        if batch.len() > 1 {
            tracing::debug!(batch_size = batch.len(), "Observations batched");
        }
        Some(batch)
    }

    fn groups_with(&self, head: &Observation, other: &Observation) -> bool {
        if other.urgency == Urgency::Noise {
            return false;
        }
        if (head.urgency == Urgency::Critical) != (other.urgency == Urgency::Critical) {
            return false;
        }
        if (other.timestamp - head.timestamp).num_milliseconds().abs() > self.window_ms {
            return false;
        }
        let same_path = matches!((&head.path, &other.path), (Some(a), Some(b)) if a == b);
        same_path || head.category == other.category
    }
}
