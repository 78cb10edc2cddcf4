//! Core observation types for the decision engine.
//!
//! An observation is the normalized, classified form of one external event.
//! These types are shared by the classifier, queue, context builder and the
//! history store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ───────────────────────────────────────────────────

/// Unique identifier for an observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationId(pub Uuid);

impl ObservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecisionId(pub Uuid);

impl DecisionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DecisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Observation Types ─────────────────────────────────────────────

/// What kind of event an observation describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    FileCreated,
    FileModified,
    FileDeleted,
    FileMoved,
    ProcessStarted,
    ProcessCompleted,
    ProcessFailed,
    TaskQueued,
    TaskCompleted,
    TaskFailed,
    TimeElapsed,
    ScheduleTriggered,
    ExternalEvent,
    UserEvent,
}

impl ObservationType {
    pub const ALL: [ObservationType; 14] = [
        Self::FileCreated,
        Self::FileModified,
        Self::FileDeleted,
        Self::FileMoved,
        Self::ProcessStarted,
        Self::ProcessCompleted,
        Self::ProcessFailed,
        Self::TaskQueued,
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::TimeElapsed,
        Self::ScheduleTriggered,
        Self::ExternalEvent,
        Self::UserEvent,
    ];

    /// The snake_case name used on the wire and in configuration tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileCreated => "file_created",
            Self::FileModified => "file_modified",
            Self::FileDeleted => "file_deleted",
            Self::FileMoved => "file_moved",
            Self::ProcessStarted => "process_started",
            Self::ProcessCompleted => "process_completed",
            Self::ProcessFailed => "process_failed",
            Self::TaskQueued => "task_queued",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TimeElapsed => "time_elapsed",
            Self::ScheduleTriggered => "schedule_triggered",
            Self::ExternalEvent => "external_event",
            Self::UserEvent => "user_event",
        }
    }

    /// Coerce a loosely-formatted event type string ("File-Modified",
    /// "fileModified", "file_modified") into a known type.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = normalize_token(raw);
        Self::ALL.into_iter().find(|t| {
            let name = t.as_str();
            name == normalized || name.trim_end_matches("_event") == normalized
        })
    }

    pub fn is_file_event(&self) -> bool {
        matches!(
            self,
            Self::FileCreated | Self::FileModified | Self::FileDeleted | Self::FileMoved
        )
    }

    pub fn is_task_event(&self) -> bool {
        matches!(self, Self::TaskQueued | Self::TaskCompleted | Self::TaskFailed)
    }

    pub fn is_process_event(&self) -> bool {
        matches!(
            self,
            Self::ProcessStarted | Self::ProcessCompleted | Self::ProcessFailed
        )
    }
}

impl fmt::Display for ObservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase, convert camelCase / dashes / spaces to snake_case.
fn normalize_token(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for c in raw.trim().chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else if c == '-' || c == ' ' || c == '.' {
            out.push('_');
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// How quickly an observation needs attention. Assigned by the classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Critical,
    Urgent,
    Routine,
    Low,
    Noise,
}

impl Urgency {
    /// Queue priority: lower drains first.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::Urgent => 25,
            Self::Routine => 50,
            Self::Low => 75,
            Self::Noise => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Urgent => "urgent",
            Self::Routine => "routine",
            Self::Low => "low",
            Self::Noise => "noise",
        }
    }
}

/// Semantic bucket an observation falls into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Intake,
    Knowledge,
    Index,
    Configuration,
    TaskLifecycle,
    Execution,
    SelfReferential,
    LearningSignal,
    System,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Knowledge => "knowledge",
            Self::Index => "index",
            Self::Configuration => "configuration",
            Self::TaskLifecycle => "task_lifecycle",
            Self::Execution => "execution",
            Self::SelfReferential => "self_referential",
            Self::LearningSignal => "learning_signal",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Observation ───────────────────────────────────────────────────

/// An immutable record of a single external event.
///
/// Only `processed` and `decision_id` change after classification, and only
/// through [`Observation::mark_processed`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub id: ObservationId,
    pub timestamp: DateTime<Utc>,
    pub observation_type: ObservationType,
    /// Source tag of the watcher that delivered the event.
    pub source: String,
    pub description: String,
    pub urgency: Urgency,
    pub category: Category,
    pub path: Option<String>,
    pub content_hash: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub related_ids: Vec<ObservationId>,
    pub parent_id: Option<ObservationId>,
    #[serde(default)]
    pub processed: bool,
    pub decision_id: Option<DecisionId>,
}

impl Observation {
    /// Set the processed flag and the back-reference to the decision that
    /// consumed this observation. Returns false if it was already processed.
    pub fn mark_processed(&mut self, decision_id: Option<DecisionId>) -> bool {
        if self.processed {
            return false;
        }
        self.processed = true;
        self.decision_id = decision_id;
        true
    }

    /// A fresh, unprocessed copy of this observation for another decision
    /// cycle. The copy links back to the original through `parent_id`.
    pub fn requeued(&self) -> Self {
        Self {
            id: ObservationId::new(),
            timestamp: Utc::now(),
            processed: false,
            decision_id: None,
            parent_id: Some(self.id),
            ..self.clone()
        }
    }

    /// File extension of the path, lowercased.
    pub fn extension(&self) -> Option<String> {
        let path = self.path.as_deref()?;
        let name = path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(path: Option<&str>) -> Observation {
        Observation {
            id: ObservationId::new(),
            timestamp: Utc::now(),
            observation_type: ObservationType::FileModified,
            source: "fs".to_string(),
            description: "edited".to_string(),
            urgency: Urgency::Routine,
            category: Category::Knowledge,
            path: path.map(String::from),
            content_hash: None,
            metadata: serde_json::Map::new(),
            related_ids: vec![],
            parent_id: None,
            processed: false,
            decision_id: None,
        }
    }

    #[test]
    fn observation_type_parse_is_lenient() {
        assert_eq!(
            ObservationType::parse("file_modified"),
            Some(ObservationType::FileModified)
        );
        assert_eq!(
            ObservationType::parse("FileDeleted"),
            Some(ObservationType::FileDeleted)
        );
        assert_eq!(
            ObservationType::parse("task-failed"),
            Some(ObservationType::TaskFailed)
        );
        assert_eq!(ObservationType::parse("user"), Some(ObservationType::UserEvent));
        assert_eq!(ObservationType::parse("bogus"), None);
    }

    #[test]
    fn urgency_priorities_are_ordered() {
        let order = [
            Urgency::Critical,
            Urgency::Urgent,
            Urgency::Routine,
            Urgency::Low,
            Urgency::Noise,
        ];
        assert!(order.windows(2).all(|w| w[0].priority() < w[1].priority()));
        assert_eq!(Urgency::Critical.priority(), 0);
        assert_eq!(Urgency::Noise.priority(), 100);
    }

    #[test]
    fn mark_processed_only_once() {
        let mut obs = observation(None);
        let first = DecisionId::new();
        assert!(obs.mark_processed(Some(first)));
        assert!(!obs.mark_processed(Some(DecisionId::new())));
        assert_eq!(obs.decision_id, Some(first));
    }

    #[test]
    fn requeued_copy_links_to_parent() {
        let mut obs = observation(Some("notes/a.md"));
        obs.mark_processed(Some(DecisionId::new()));
        let again = obs.requeued();
        assert_ne!(again.id, obs.id);
        assert_eq!(again.parent_id, Some(obs.id));
        assert!(!again.processed);
        assert_eq!(again.path, obs.path);
    }

    #[test]
    fn extension_ignores_dotfiles() {
        assert_eq!(observation(Some("a/b/Notes.MD")).extension().as_deref(), Some("md"));
        assert_eq!(observation(Some("a/.gitignore")).extension(), None);
        assert_eq!(observation(None).extension(), None);
    }
}
