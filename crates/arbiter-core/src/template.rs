//! Action templates: stored example decisions used as few-shot context and,
//! for recognized action types, as a pre-validated execution fast-path.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::{ActionSpec, ExecutorKind};
use crate::types::{Category, ObservationType};

/// Unique identifier for an action template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TemplateId(pub Uuid);

impl TemplateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TemplateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a template came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateOrigin {
    Static,
    Learned,
}

/// One primitive step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub executor: ExecutorKind,
    pub description: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// A named, versioned worked example.
///
/// The example content is immutable once created; `usage_count` and
/// `success_rate` are the only fields updated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionTemplate {
    pub id: TemplateId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub origin: TemplateOrigin,
    /// Describes the situations this template was written for.
    pub trigger: String,
    pub category: Option<Category>,
    pub observation_type: Option<ObservationType>,
    /// Path prefix the template applies to, if any.
    pub path_prefix: Option<String>,
    pub example_reasoning: String,
    pub example_action: ActionSpec,
    pub example_outcome: String,
    /// Pre-validated steps instantiated when an action of this type is
    /// dispatched. Action details fill `{key}` placeholders and any keys a
    /// step leaves unset. An empty list runs the action itself as one step.
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ActionTemplate {
    pub fn action_type(&self) -> &str {
        &self.example_action.action_type
    }

    /// Fold one more usage into the running success rate.
    pub fn record_usage(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.usage_count += 1;
        self.success_rate += (outcome - self.success_rate) / self.usage_count as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ActionTemplate {
        ActionTemplate {
            id: TemplateId::new(),
            name: "rebuild index".to_string(),
            version: 1,
            origin: TemplateOrigin::Static,
            trigger: "index file changed".to_string(),
            category: Some(Category::Index),
            observation_type: Some(ObservationType::FileModified),
            path_prefix: None,
            example_reasoning: "index is stale".to_string(),
            example_action: ActionSpec {
                action_type: "rebuild_index".to_string(),
                description: "Rebuild".to_string(),
                details: serde_json::Map::new(),
                executor: ExecutorKind::Script,
                priority: 50,
            },
            example_outcome: "index rebuilt".to_string(),
            steps: vec![],
            timeout_secs: None,
            max_retries: None,
            usage_count: 0,
            success_rate: 0.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn usage_updates_success_rate() {
        let mut t = template();
        t.record_usage(true);
        assert_eq!(t.usage_count, 1);
        assert!((t.success_rate - 1.0).abs() < f64::EPSILON);
        t.record_usage(false);
        assert_eq!(t.usage_count, 2);
        assert!((t.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(t.action_type(), "rebuild_index");
    }
}
