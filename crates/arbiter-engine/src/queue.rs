//! Observation priority queue.
//!
//! Ordered by urgency priority (CRITICAL = 0 … NOISE = 100), FIFO among
//! equal priorities via a monotonically increasing sequence number.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use arbiter_core::{Observation, Urgency};

struct Entry {
    priority: u8,
    seq: u64,
    enqueued_at: Instant,
    observation: Observation,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: the lowest (priority, seq) must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Default)]
pub struct ObservationQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl ObservationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an observation; returns its sequence number.
    pub fn add(&mut self, observation: Observation) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::debug!(
            observation_id = %observation.id,
            urgency = ?observation.urgency,
            seq,
            "Observation enqueued"
        );
        self.heap.push(Entry {
            priority: observation.urgency.priority(),
            seq,
            enqueued_at: Instant::now(),
            observation,
        });
        seq
    }

    /// Pop the highest-priority, earliest-enqueued observation.
    pub fn get_next(&mut self) -> Option<Observation> {
        self.heap.pop().map(|e| e.observation)
    }

    pub fn peek(&self) -> Option<&Observation> {
        self.heap.peek().map(|e| &e.observation)
    }

    /// How long the head has been waiting.
    pub fn head_age(&self) -> Option<Duration> {
        self.heap.peek().map(|e| e.enqueued_at.elapsed())
    }

    /// Remove and return every CRITICAL observation in enqueue order. The
    /// rest of the queue keeps its order.
    pub fn get_all_critical(&mut self) -> Vec<Observation> {
        let mut critical = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|e| e.observation.urgency == Urgency::Critical)
        {
            if let Some(entry) = self.heap.pop() {
                critical.push(entry.observation);
            }
        }
        critical
    }

    /// Remove up to `limit` observations matching `pred`, visiting in queue
    /// order. Remaining entries keep their sequence numbers.
    pub fn drain_where(
        &mut self,
        limit: usize,
        mut pred: impl FnMut(&Observation) -> bool,
    ) -> Vec<Observation> {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        entries.sort_by_key(|e| (e.priority, e.seq));

        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if taken.len() < limit && pred(&entry.observation) {
                taken.push(entry.observation);
            } else {
                kept.push(entry);
            }
        }
        self.heap = BinaryHeap::from(kept);
        taken
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Shared handle: the ingestion side pushes, the decision loop pops.
#[derive(Clone, Default)]
pub struct QueueHandle {
    inner: Arc<Mutex<ObservationQueue>>,
    notify: Arc<Notify>,
}

impl QueueHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, observation: Observation) -> u64 {
        let seq = self.lock().add(observation);
        self.notify.notify_one();
        seq
    }

    pub fn push_all(&self, observations: impl IntoIterator<Item = Observation>) {
        {
            let mut queue = self.lock();
            for observation in observations {
                queue.add(observation);
            }
        }
        self.notify.notify_one();
    }

    /// Lock the queue. A poisoned lock is recovered: the heap is never left
    /// half-updated by a panicking holder.
    pub fn lock(&self) -> MutexGuard<'_, ObservationQueue> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves after the next push (or immediately if one happened since the
    /// last wait).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
