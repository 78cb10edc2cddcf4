//! Arbiter History — append-only record of every decision the engine makes.
//!
//! Each decision is persisted together with its reasoning trace and the
//! observations that triggered it, content-hashed with BLAKE3 so edits to the
//! trace are detectable. Alongside the decisions live the pattern-statistics
//! table used for calibration, the escalation outbox, and JSONL journals for
//! lessons and novel actions.

pub mod hash;
pub mod journal;
pub mod outbox;
pub mod stats;
pub mod store;
pub mod trace;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use arbiter_core::{Category, Decision, Observation, ObservationType, PatternKey};

pub use journal::Journal;
pub use outbox::{Escalation, EscalationOutbox, Resolution};
pub use store::{DecisionQuery, FileHistoryStore, HistoryStore, StoreError};
pub use trace::TraceRecorder;

/// A persisted decision: the decision itself, the observations it consumed,
/// and the pattern key its statistics are filed under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub decision: Decision,
    pub observations: Vec<Observation>,
    /// Category of the primary (first) observation.
    pub category: Category,
    /// Type of the primary (first) observation.
    pub observation_type: ObservationType,
    pub pattern_key: PatternKey,
    pub recorded_at: DateTime<Utc>,
    /// BLAKE3 hash (hex) over everything except the outcome fields.
    pub content_hash: Option<String>,
}

impl DecisionRecord {
    /// Build a record and compute its content hash.
    ///
    /// The primary observation decides category and type; an empty batch
    /// files under SYSTEM / external_event.
    pub fn seal(decision: Decision, observations: Vec<Observation>) -> Self {
        let (category, observation_type) = observations
            .first()
            .map(|o| (o.category, o.observation_type))
            .unwrap_or((Category::System, ObservationType::ExternalEvent));
        let pattern_key = PatternKey::new(
            category,
            observation_type,
            decision.decision_type(),
            decision.action().map(|a| a.action_type.as_str()),
        );

        let mut record = Self {
            decision,
            observations,
            category,
            observation_type,
            pattern_key,
            recorded_at: Utc::now(),
            content_hash: None,
        };
        record.content_hash = Some(record.compute_hash());
        record
    }

    /// Compute the BLAKE3 hash of the record's immutable content.
    pub fn compute_hash(&self) -> String {
        hash::compute_record_hash(self)
    }

    /// Verify that the stored content_hash matches a freshly computed hash.
    pub fn verify_integrity(&self) -> bool {
        match &self.content_hash {
            Some(stored) => stored == &self.compute_hash(),
            None => false,
        }
    }
}

/// Why a lesson was written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    /// A high-confidence decision failed.
    OverconfidentFailure,
    /// A low-confidence decision succeeded anyway.
    UnderconfidentSuccess,
}

/// One entry of the lessons log, read later for threshold tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lesson {
    pub timestamp: DateTime<Utc>,
    pub decision_id: arbiter_core::DecisionId,
    pub pattern_key: PatternKey,
    pub kind: LessonKind,
    pub confidence: f64,
    pub text: String,
}
