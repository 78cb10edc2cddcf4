//! Builder-pattern recorder for a decision's reasoning trace.
//!
//! Used by the reasoner to record each stage as it completes:
//!
//! ```
//! # use arbiter_history::trace::TraceRecorder;
//! # use arbiter_core::{DecisionPayload, ObservationId, ReasoningStage};
//! let mut trace = TraceRecorder::new(vec![ObservationId::new()], 0.5);
//! trace.record(ReasoningStage::Observe, serde_json::json!({"summary": "file edited"}), 0.1, 1, None);
//! let decision = trace.finalize(
//!     DecisionPayload::Investigate { queries: vec!["who edited it?".into()] },
//!     "Needs more context",
//! );
//! assert_eq!(decision.steps.len(), 1);
//! assert!((decision.raw_confidence - 0.6).abs() < 1e-9);
//! ```

use chrono::Utc;

use arbiter_core::{Decision, DecisionId, DecisionPayload, ObservationId, ReasoningStage, ReasoningStep};

/// Accumulates reasoning steps and the running confidence for one cycle.
pub struct TraceRecorder {
    id: DecisionId,
    observation_ids: Vec<ObservationId>,
    steps: Vec<ReasoningStep>,
    confidence: f64,
}

impl TraceRecorder {
    /// Start a trace with the given seed confidence.
    pub fn new(observation_ids: Vec<ObservationId>, seed_confidence: f64) -> Self {
        Self {
            id: DecisionId::new(),
            observation_ids,
            steps: Vec::new(),
            confidence: seed_confidence,
        }
    }

    /// Append one step. The delta is added to the running confidence, which
    /// is clamped to [0, 1].
    pub fn record(
        &mut self,
        stage: ReasoningStage,
        output: serde_json::Value,
        confidence_delta: f64,
        attempts: u32,
        note: Option<String>,
    ) -> &ReasoningStep {
        self.confidence = (self.confidence + confidence_delta).clamp(0.0, 1.0);
        self.steps.push(ReasoningStep {
            index: self.steps.len() as u32,
            stage,
            output,
            confidence_delta,
            confidence_after: self.confidence,
            attempts,
            note,
            timestamp: Utc::now(),
        });
        &self.steps[self.steps.len() - 1]
    }

    /// Overwrite the running confidence without recording a step.
    pub fn force_confidence(&mut self, confidence: f64) {
        self.confidence = confidence.clamp(0.0, 1.0);
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn steps(&self) -> &[ReasoningStep] {
        &self.steps
    }

    /// The decision ID for this trace (available before finalization).
    pub fn id(&self) -> DecisionId {
        self.id
    }

    /// Finish the trace. Calibrated and raw confidence both start at the
    /// accumulated value; calibration overwrites `confidence` later.
    pub fn finalize(self, payload: DecisionPayload, reasoning: &str) -> Decision {
        Decision {
            id: self.id,
            timestamp: Utc::now(),
            confidence: self.confidence,
            raw_confidence: self.confidence,
            reasoning: reasoning.to_string(),
            payload,
            observation_ids: self.observation_ids,
            steps: self.steps,
            executed: false,
            outcome: None,
            outcome_success: None,
            outcome_timestamp: None,
        }
    }
}
