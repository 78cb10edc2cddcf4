//! Ingestion boundary: raw events in, classified observations queued.
//!
//! Any number of watchers may hold an `Ingestor`; ingestion never waits on
//! the decision loop.

use std::sync::{Arc, RwLock};

use arbiter_core::{ObservationId, RawEvent};

use crate::classifier::Classifier;
use crate::queue::QueueHandle;

/// The classifier currently in force. Swapped whole on config reload.
#[derive(Clone)]
pub struct ClassifierCell(Arc<RwLock<Arc<Classifier>>>);

impl ClassifierCell {
    pub fn new(classifier: Classifier) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(classifier))))
    }

    pub fn get(&self) -> Arc<Classifier> {
        Arc::clone(&self.0.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn replace(&self, classifier: Classifier) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(classifier);
    }
}

#[derive(Clone)]
pub struct Ingestor {
    classifier: ClassifierCell,
    queue: QueueHandle,
}

impl Ingestor {
    pub fn new(classifier: ClassifierCell, queue: QueueHandle) -> Self {
        Self { classifier, queue }
    }

    /// Classify and enqueue one event.
    pub fn ingest(&self, event: RawEvent) -> ObservationId {
        let observation = self.classifier.get().classify(&event);
        let id = observation.id;
        tracing::debug!(
            observation_id = %id,
            observation_type = %observation.observation_type,
            urgency = ?observation.urgency,
            category = %observation.category,
            path = ?observation.path,
            "Observation ingested"
        );
        self.queue.push(observation);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::config::ClassifierConfig;
    use arbiter_core::Urgency;

    #[test]
    fn ingest_classifies_and_queues() {
        let queue = QueueHandle::new();
        let cell = ClassifierCell::new(Classifier::new(&ClassifierConfig::default()).unwrap());
        let ingestor = Ingestor::new(cell, queue.clone());

        let id = ingestor.ingest(RawEvent::new("supervisor", "task_failed", "build broke"));
        let head = queue.lock().get_next().unwrap();
        assert_eq!(head.id, id);
        assert_eq!(head.urgency, Urgency::Critical);
    }

    #[test]
    fn replaced_classifier_applies_to_later_events() {
        let queue = QueueHandle::new();
        let cell = ClassifierCell::new(Classifier::new(&ClassifierConfig::default()).unwrap());
        let ingestor = Ingestor::new(cell.clone(), queue.clone());

        let quiet = ClassifierConfig {
            urgency_overrides: [("task_failed".to_string(), Urgency::Low)].into_iter().collect(),
            ..Default::default()
        };
        cell.replace(Classifier::new(&quiet).unwrap());
        ingestor.ingest(RawEvent::new("supervisor", "task_failed", "flaky test"));
        assert_eq!(queue.lock().get_next().unwrap().urgency, Urgency::Low);
    }
}
