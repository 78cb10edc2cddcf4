//! BLAKE3 content hashing for tamper evidence.
//!
//! The hash covers the decision, its reasoning trace and the observation
//! snapshots. The outcome fields are excluded because they are written once,
//! after execution, onto an already-sealed record.

use chrono::{DateTime, Utc};
use serde::Serialize;

use arbiter_core::{
    Category, DecisionId, DecisionPayload, Observation, ObservationId, ObservationType,
    PatternKey, ReasoningStep,
};

use crate::DecisionRecord;

/// Hashable representation of a record (excludes hash and outcome fields).
#[derive(Serialize)]
struct HashableRecord<'a> {
    id: &'a DecisionId,
    timestamp: &'a DateTime<Utc>,
    confidence: f64,
    raw_confidence: f64,
    reasoning: &'a str,
    payload: &'a DecisionPayload,
    observation_ids: &'a [ObservationId],
    steps: &'a [ReasoningStep],
    observations: &'a [Observation],
    category: &'a Category,
    observation_type: &'a ObservationType,
    pattern_key: &'a PatternKey,
    recorded_at: &'a DateTime<Utc>,
}

/// Compute the BLAKE3 hash of a record's immutable content.
///
/// Serializes the hashable fields to canonical JSON, then hashes the bytes
/// with BLAKE3. Returns the hex-encoded hash.
pub fn compute_record_hash(record: &DecisionRecord) -> String {
    let decision = &record.decision;
    let hashable = HashableRecord {
        id: &decision.id,
        timestamp: &decision.timestamp,
        confidence: decision.confidence,
        raw_confidence: decision.raw_confidence,
        reasoning: &decision.reasoning,
        payload: &decision.payload,
        observation_ids: &decision.observation_ids,
        steps: &decision.steps,
        observations: &record.observations,
        category: &record.category,
        observation_type: &record.observation_type,
        pattern_key: &record.pattern_key,
        recorded_at: &record.recorded_at,
    };

    let mut hasher = blake3::Hasher::new();
    match serde_json::to_vec(&hashable) {
        Ok(json) => {
            hasher.update(&json);
        }
        // Only non-finite floats fail here; hash their debug form instead so
        // the record is still sealed deterministically.
        Err(_) => {
            hasher.update(format!("{:?}", record.decision).as_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use arbiter_core::{Outcome, OutcomeKind};

    use crate::trace::tests::sample_record;

    #[test]
    fn hash_ignores_outcome_fields() {
        let mut record = sample_record();
        let before = record.compute_hash();
        record
            .decision
            .record_outcome(&Outcome::new(OutcomeKind::Success, "done", 1));
        assert_eq!(before, record.compute_hash());
        assert!(record.verify_integrity());
    }

    #[test]
    fn hash_covers_reasoning_trace() {
        let mut record = sample_record();
        let before = record.compute_hash();
        record.decision.steps[0].confidence_delta = 0.2;
        assert_ne!(before, record.compute_hash());
        assert!(!record.verify_integrity());
    }
}
