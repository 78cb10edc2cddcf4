//! Decision types: the engine's output for one reasoning cycle, the
//! reasoning trace attached to it, and the outcome recorded afterwards.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Category, DecisionId, ObservationId, ObservationType};

/// The four decisions the engine can emit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    Act,
    Wait,
    Investigate,
    Escalate,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Act => "ACT",
            Self::Wait => "WAIT",
            Self::Investigate => "INVESTIGATE",
            Self::Escalate => "ESCALATE",
        }
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution backends an action can be routed to.
///
/// The set is closed; `Custom` marks an action the dispatcher must
/// decompose into primitive steps on one of the other backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Script,
    Task,
    Swarm,
    Internal,
    Http,
    Custom,
}

impl ExecutorKind {
    /// Backends that actually run something.
    pub const PRIMITIVE: [ExecutorKind; 5] = [
        Self::Script,
        Self::Task,
        Self::Swarm,
        Self::Internal,
        Self::Http,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Task => "task",
            Self::Swarm => "swarm",
            Self::Internal => "internal",
            Self::Http => "http",
            Self::Custom => "custom",
        }
    }

    /// Parse an executor name, accepting the aliases oracles tend to use.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "script" | "shell" | "bash" | "script_execution" | "command" => Some(Self::Script),
            "task" | "delegate" | "single_task" | "task_delegate" | "agent" => Some(Self::Task),
            "swarm" | "multi_agent" | "swarm_delegate" | "agents" => Some(Self::Swarm),
            "internal" | "noop" | "no_op" | "none" => Some(Self::Internal),
            "http" | "webhook" | "api" | "http_call" => Some(Self::Http),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an ACT decision. `action_type` may be one no template knows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    pub description: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
    pub executor: ExecutorKind,
    /// 0 is most important, 100 least.
    #[serde(default = "default_action_priority")]
    pub priority: u8,
}

fn default_action_priority() -> u8 {
    50
}

/// Decision-type-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionPayload {
    Act {
        action: ActionSpec,
    },
    Wait {
        resume_conditions: Vec<String>,
        timeout_secs: Option<u64>,
    },
    Investigate {
        queries: Vec<String>,
    },
    Escalate {
        reason: String,
        priority: u8,
    },
}

impl DecisionPayload {
    pub fn decision_type(&self) -> DecisionType {
        match self {
            Self::Act { .. } => DecisionType::Act,
            Self::Wait { .. } => DecisionType::Wait,
            Self::Investigate { .. } => DecisionType::Investigate,
            Self::Escalate { .. } => DecisionType::Escalate,
        }
    }
}

// ── Reasoning trace ───────────────────────────────────────────────

/// The five fixed reasoning stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStage {
    Observe,
    Categorize,
    MatchPattern,
    Evaluate,
    Decide,
}

impl ReasoningStage {
    pub const ORDER: [ReasoningStage; 5] = [
        Self::Observe,
        Self::Categorize,
        Self::MatchPattern,
        Self::Evaluate,
        Self::Decide,
    ];

    /// Allowed confidence delta for this stage, as (min, max).
    pub fn delta_range(&self) -> (f64, f64) {
        match self {
            Self::Observe => (-0.1, 0.2),
            Self::Categorize => (-0.1, 0.15),
            Self::MatchPattern => (-0.1, 0.2),
            Self::Evaluate => (-0.1, 0.15),
            Self::Decide => (0.0, 0.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observe => "observe",
            Self::Categorize => "categorize",
            Self::MatchPattern => "match_pattern",
            Self::Evaluate => "evaluate",
            Self::Decide => "decide",
        }
    }
}

impl fmt::Display for ReasoningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a decision's reasoning trace. Never mutated once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningStep {
    pub index: u32,
    pub stage: ReasoningStage,
    /// The stage's parsed oracle output, or `null` when parsing failed.
    pub output: serde_json::Value,
    pub confidence_delta: f64,
    pub confidence_after: f64,
    /// Oracle attempts spent on this stage.
    pub attempts: u32,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ── Outcome ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failed,
    Timeout,
    /// Rejected before running: invalid action, missing capability, or a
    /// safety rejection discovered during planning.
    Rejected,
}

/// Result of executing an ACT decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub summary: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl Outcome {
    pub fn new(kind: OutcomeKind, summary: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            summary: summary.into(),
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

// ── Decision ──────────────────────────────────────────────────────

/// The engine's typed output for one reasoning cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: DecisionId,
    pub timestamp: DateTime<Utc>,
    /// Final, calibrated confidence.
    pub confidence: f64,
    /// Confidence accumulated by the reasoner before calibration.
    pub raw_confidence: f64,
    pub reasoning: String,
    pub payload: DecisionPayload,
    pub observation_ids: Vec<ObservationId>,
    pub steps: Vec<ReasoningStep>,
    pub executed: bool,
    pub outcome: Option<String>,
    pub outcome_success: Option<bool>,
    pub outcome_timestamp: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn decision_type(&self) -> DecisionType {
        self.payload.decision_type()
    }

    pub fn action(&self) -> Option<&ActionSpec> {
        match &self.payload {
            DecisionPayload::Act { action } => Some(action),
            _ => None,
        }
    }

    pub fn escalation_reason(&self) -> Option<&str> {
        match &self.payload {
            DecisionPayload::Escalate { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn has_outcome(&self) -> bool {
        self.outcome_timestamp.is_some()
    }

    /// Record the post-execution outcome. Returns false if an outcome was
    /// already recorded; the decision is left untouched in that case.
    pub fn record_outcome(&mut self, outcome: &Outcome) -> bool {
        if self.has_outcome() {
            return false;
        }
        self.executed = outcome.kind != OutcomeKind::Rejected;
        self.outcome = Some(format!("{:?}: {}", outcome.kind, outcome.summary));
        self.outcome_success = Some(outcome.is_success());
        self.outcome_timestamp = Some(outcome.timestamp);
        true
    }
}

// ── Pattern statistics ────────────────────────────────────────────

/// Composite key for historical statistics and calibration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternKey(pub String);

impl PatternKey {
    pub fn new(
        category: Category,
        observation_type: ObservationType,
        decision_type: DecisionType,
        action_type: Option<&str>,
    ) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            category.as_str(),
            observation_type.as_str(),
            decision_type.as_str(),
            action_type.unwrap_or("-")
        ))
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Running totals for one pattern key. Only ever accumulates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternStats {
    pub key: PatternKey,
    pub count: u64,
    /// Decisions whose outcome has been recorded.
    pub outcome_count: u64,
    pub success_count: u64,
    pub avg_confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl PatternStats {
    pub fn new(key: PatternKey) -> Self {
        Self {
            key,
            count: 0,
            outcome_count: 0,
            success_count: 0,
            avg_confidence: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Fold one more decision's confidence into the running average.
    pub fn record_decision(&mut self, confidence: f64) {
        self.count += 1;
        self.avg_confidence += (confidence - self.avg_confidence) / self.count as f64;
        self.updated_at = Utc::now();
    }

    pub fn record_outcome(&mut self, success: bool) {
        self.outcome_count += 1;
        if success {
            self.success_count += 1;
        }
        self.updated_at = Utc::now();
    }

    /// Historical success rate, if any outcome is known.
    pub fn success_rate(&self) -> Option<f64> {
        if self.outcome_count == 0 {
            None
        } else {
            Some(self.success_count as f64 / self.outcome_count as f64)
        }
    }
}
