//! Outcome learner: runs once an ACT's outcome is known.
//!
//! - A successful novel action becomes a learned template.
//! - A template used on the fast path has its usage statistics updated.
//! - A failure at high confidence or a success at low confidence appends a
//!   lesson for later threshold tuning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use arbiter_core::config::CalibrationConfig;
use arbiter_core::{ActionTemplate, Outcome, PlanStep, TemplateId, TemplateOrigin};
use arbiter_history::{DecisionRecord, Journal, Lesson, LessonKind};

use crate::dispatch::{ExecutionPlan, PlanSource};
use crate::templates::TemplateLibrary;

/// Learned template IDs are UUIDv5 of the action type in this namespace, so
/// the same novel action learned twice maps to one template.
pub const LEARNED_TEMPLATE_NAMESPACE: Uuid = Uuid::from_u128(0x9a4c_21f0_5b7e_4d0e_8f36_1c2b_7a90_e5d4);

/// What the learner did with one outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnReport {
    pub learned_template: Option<TemplateId>,
    pub template_usage: Option<TemplateId>,
    pub lesson: Option<LessonKind>,
}

pub struct OutcomeLearner {
    templates: Arc<TemplateLibrary>,
    lessons: Journal<Lesson>,
}

impl OutcomeLearner {
    pub fn new(templates: Arc<TemplateLibrary>, lessons_path: impl Into<PathBuf>) -> Self {
        Self {
            templates,
            lessons: Journal::new(lessons_path),
        }
    }

    pub fn lessons(&self) -> &Journal<Lesson> {
        &self.lessons
    }

    /// Fold one outcome back in. `plan` is `None` when the action never got
    /// a plan. Failures here are logged and never undo the recorded outcome.
    pub fn learn(
        &self,
        record: &DecisionRecord,
        plan: Option<&ExecutionPlan>,
        outcome: &Outcome,
        config: &CalibrationConfig,
    ) -> LearnReport {
        let mut report = LearnReport::default();
        let decision_id = record.decision.id;

        match plan.map(|p| (p, p.source)) {
            Some((_, PlanSource::Template(id))) => match self.templates.record_usage(id, outcome.is_success()) {
                Ok(true) => report.template_usage = Some(id),
                Ok(false) => {
                    tracing::debug!(template_id = %id, "Template no longer in library")
                }
                Err(e) => {
                    tracing::warn!(template_id = %id, error = %e, "Could not update template usage")
                }
            },
            Some((plan, PlanSource::Novel)) if outcome.is_success() => {
                if let Some(template) = learned_template(record, plan, outcome) {
                    let id = template.id;
                    match self.templates.add_learned(template) {
                        Ok(true) => report.learned_template = Some(id),
                        Ok(false) => {
                            if let Err(e) = self.templates.record_usage(id, true) {
                                tracing::warn!(template_id = %id, error = %e, "Could not update template usage");
                            }
                            report.template_usage = Some(id);
                        }
                        Err(e) => {
                            tracing::warn!(decision_id = %decision_id, error = %e, "Could not save learned template")
                        }
                    }
                }
            }
            _ => {}
        }

        let confidence = record.decision.confidence;
        let kind = if !outcome.is_success() && confidence >= config.overconfident_threshold {
            Some(LessonKind::OverconfidentFailure)
        } else if outcome.is_success() && confidence <= config.underconfident_threshold {
            Some(LessonKind::UnderconfidentSuccess)
        } else {
            None
        };

        if let Some(kind) = kind {
            let lesson = Lesson {
                timestamp: Utc::now(),
                decision_id,
                pattern_key: record.pattern_key.clone(),
                kind,
                confidence,
                text: lesson_text(record, kind, outcome),
            };
            match self.lessons.append(&lesson) {
                Ok(()) => {
                    tracing::info!(
                        decision_id = %decision_id,
                        pattern_key = %record.pattern_key,
                        kind = ?kind,
                        confidence,
                        "Lesson recorded"
                    );
                    report.lesson = Some(kind);
                }
                Err(e) => tracing::warn!(decision_id = %decision_id, error = %e, "Could not append lesson"),
            }
        }

        report
    }
}

fn learned_template(record: &DecisionRecord, plan: &ExecutionPlan, outcome: &Outcome) -> Option<ActionTemplate> {
    let action = record.decision.action()?;
    let primary = record.observations.first();
    let path_prefix = primary
        .and_then(|o| o.path.as_deref())
        .and_then(|p| Path::new(p).parent())
        .map(|dir| dir.to_string_lossy().to_string())
        .filter(|dir| !dir.is_empty())
        .map(|dir| format!("{}/", dir.trim_end_matches('/')));

    let mut template = ActionTemplate {
        id: TemplateId(Uuid::new_v5(
            &LEARNED_TEMPLATE_NAMESPACE,
            action.action_type.as_bytes(),
        )),
        name: action.action_type.replace('_', " "),
        version: 1,
        origin: TemplateOrigin::Learned,
        trigger: primary
            .map(|o| o.description.clone())
            .unwrap_or_else(|| action.description.clone()),
        category: Some(record.category),
        observation_type: Some(record.observation_type),
        path_prefix,
        example_reasoning: record.decision.reasoning.clone(),
        example_action: action.clone(),
        example_outcome: outcome.summary.clone(),
        steps: generalize_steps(&plan.steps, &action.details),
        timeout_secs: None,
        max_retries: None,
        usage_count: 0,
        success_rate: 0.0,
        created_at: Utc::now(),
    };
    template.record_usage(true);
    Some(template)
}

/// Swap the action's concrete detail values in each step for `{key}`
/// placeholders, so a later action of the same type fills in its own.
fn generalize_steps(steps: &[PlanStep], params: &Map<String, Value>) -> Vec<PlanStep> {
    let mut values: Vec<(&str, &str)> = params
        .iter()
        .filter(|(key, _)| key.as_str() != "confirmation")
        .filter_map(|(key, value)| value.as_str().map(|v| (v, key.as_str())))
        .filter(|(value, _)| value.len() >= 2)
        .collect();
    values.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    steps
        .iter()
        .map(|step| PlanStep {
            executor: step.executor,
            description: placeholders(&step.description, &values),
            details: step
                .details
                .iter()
                .map(|(k, v)| (k.clone(), generalize_value(v, &values)))
                .collect(),
        })
        .collect()
}

fn generalize_value(value: &Value, values: &[(&str, &str)]) -> Value {
    match value {
        Value::String(s) => Value::String(placeholders(s, values)),
        Value::Array(items) => Value::Array(items.iter().map(|v| generalize_value(v, values)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), generalize_value(v, values)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Single left-to-right pass. Only whole-word occurrences are replaced;
/// `values` is longest first so the widest match wins.
fn placeholders(text: &str, values: &[(&str, &str)]) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut prev: Option<char> = None;
    'scan: while let Some(ch) = rest.chars().next() {
        if !prev.is_some_and(is_word) {
            for (value, key) in values {
                let Some(after) = rest.strip_prefix(value) else {
                    continue;
                };
                if after.chars().next().is_some_and(is_word) {
                    continue;
                }
                out.push('{');
                out.push_str(key);
                out.push('}');
                prev = value.chars().last();
                rest = after;
                continue 'scan;
            }
        }
        out.push(ch);
        prev = Some(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

fn lesson_text(record: &DecisionRecord, kind: LessonKind, outcome: &Outcome) -> String {
    let action_type = record
        .decision
        .action()
        .map(|a| a.action_type.as_str())
        .unwrap_or("-");
    let verdict = match kind {
        LessonKind::OverconfidentFailure => "failed despite high confidence",
        LessonKind::UnderconfidentSuccess => "succeeded despite low confidence",
    };
    format!(
        "{} `{action_type}` on {} {verdict} ({:.2}; raw {:.2}): {}",
        record.decision.decision_type(),
        record.pattern_key,
        record.decision.confidence,
        record.decision.raw_confidence,
        outcome.summary
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arbiter_core::{
        ActionSpec, Category, Decision, DecisionId, DecisionPayload, ExecutorKind, Observation,
        ObservationId, ObservationType, OutcomeKind, PlanStep, Urgency,
    };

    fn record(action_type: &str, confidence: f64) -> DecisionRecord {
        let observation = Observation {
            id: ObservationId::new(),
            timestamp: Utc::now(),
            observation_type: ObservationType::FileModified,
            source: "fs".to_string(),
            description: "file_modified: src/lib.rs".to_string(),
            urgency: Urgency::Routine,
            category: Category::Execution,
            path: Some("src/lib.rs".to_string()),
            content_hash: None,
            metadata: serde_json::Map::new(),
            related_ids: vec![],
            parent_id: None,
            processed: true,
            decision_id: None,
        };
        let decision = Decision {
            id: DecisionId::new(),
            timestamp: Utc::now(),
            confidence,
            raw_confidence: confidence,
            reasoning: "diff needs review".to_string(),
            payload: DecisionPayload::Act {
                action: ActionSpec {
                    action_type: action_type.to_string(),
                    description: "Review the change".to_string(),
                    details: serde_json::Map::new(),
                    executor: ExecutorKind::Custom,
                    priority: 50,
                },
            },
            observation_ids: vec![observation.id],
            steps: vec![],
            executed: false,
            outcome: None,
            outcome_success: None,
            outcome_timestamp: None,
        };
        DecisionRecord::seal(decision, vec![observation])
    }

    fn novel_plan() -> ExecutionPlan {
        ExecutionPlan {
            source: PlanSource::Novel,
            steps: vec![PlanStep {
                executor: ExecutorKind::Task,
                description: "review".to_string(),
                details: serde_json::Map::new(),
            }],
            timeout: Duration::from_secs(60),
            max_retries: 1,
        }
    }

    fn learner(dir: &Path) -> (OutcomeLearner, Arc<TemplateLibrary>) {
        let templates = Arc::new(TemplateLibrary::load(dir.join("templates")).unwrap());
        (
            OutcomeLearner::new(templates.clone(), dir.join("lessons.jsonl")),
            templates,
        )
    }

    #[test]
    fn novel_success_becomes_template() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, templates) = learner(dir.path());
        let rec = record("code_review_with_suggestions", 0.75);
        let outcome = Outcome::new(OutcomeKind::Success, "review posted", 1);

        let report = learner.learn(&rec, Some(&novel_plan()), &outcome, &CalibrationConfig::default());
        let id = report.learned_template.unwrap();
        let t = templates.get(id).unwrap();
        assert_eq!(t.usage_count, 1);
        assert_eq!(t.origin, TemplateOrigin::Learned);
        assert_eq!(t.path_prefix.as_deref(), Some("src/"));
        assert_eq!(t.steps.len(), 1);
        assert!(templates
            .find_by_action_type("code_review_with_suggestions")
            .is_some());
        assert!(report.lesson.is_none());

        // Same action type again maps to the same template.
        let again = learner.learn(
            &record("code_review_with_suggestions", 0.75),
            Some(&novel_plan()),
            &outcome,
            &CalibrationConfig::default(),
        );
        assert_eq!(again.learned_template, None);
        assert_eq!(again.template_usage, Some(id));
        assert_eq!(templates.get(id).unwrap().usage_count, 2);
    }

    #[test]
    fn learned_steps_take_placeholders_for_action_details() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, templates) = learner(dir.path());
        let mut rec = record("format_file", 0.75);
        if let DecisionPayload::Act { action } = &mut rec.decision.payload {
            action.details = serde_json::json!({"path": "src/parser.rs", "style": "ed"})
                .as_object()
                .cloned()
                .unwrap();
        }
        let mut plan = novel_plan();
        plan.steps = vec![PlanStep {
            executor: ExecutorKind::Script,
            description: "format src/parser.rs".to_string(),
            details: serde_json::json!({"command": "rustfmt --edition 2021 src/parser.rs"})
                .as_object()
                .cloned()
                .unwrap(),
        }];
        let outcome = Outcome::new(OutcomeKind::Success, "formatted", 1);

        let id = learner
            .learn(&rec, Some(&plan), &outcome, &CalibrationConfig::default())
            .learned_template
            .unwrap();
        let step = &templates.get(id).unwrap().steps[0];
        assert_eq!(step.description, "format {path}");
        // "ed" inside "--edition" is not a whole word.
        assert_eq!(step.details["command"], "rustfmt --edition 2021 {path}");
    }

    #[test]
    fn novel_failure_learns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, templates) = learner(dir.path());
        let outcome = Outcome::new(OutcomeKind::Failed, "exit 1", 2);
        let report = learner.learn(
            &record("code_review_with_suggestions", 0.6),
            Some(&novel_plan()),
            &outcome,
            &CalibrationConfig::default(),
        );
        assert_eq!(report, LearnReport::default());
        assert!(templates.is_empty());
    }

    #[test]
    fn confidence_mismatches_write_lessons() {
        let dir = tempfile::tempdir().unwrap();
        let (learner, _) = learner(dir.path());
        let config = CalibrationConfig::default();

        let failed = Outcome::new(OutcomeKind::Timeout, "timed out", 2);
        let report = learner.learn(&record("deploy", 0.9), Some(&novel_plan()), &failed, &config);
        assert_eq!(report.lesson, Some(LessonKind::OverconfidentFailure));

        let lucky = Outcome::new(OutcomeKind::Success, "ok", 1);
        let report = learner.learn(&record("tidy", 0.35), Some(&novel_plan()), &lucky, &config);
        assert_eq!(report.lesson, Some(LessonKind::UnderconfidentSuccess));

        let lessons = learner.lessons().read_all().unwrap();
        assert_eq!(lessons.len(), 2);
        assert!(lessons[0].text.contains("failed despite high confidence"));
    }
}
