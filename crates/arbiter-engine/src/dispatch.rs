//! Executor dispatch: turn an ACT into a step plan and run it.
//!
//! A recognized action type instantiates its template's steps (the fast
//! path). Anything else is novel: one extra oracle call decomposes it into
//! primitive steps, and the action plus derived plan is journaled whatever
//! happens next. Steps run in order; the first failing step ends the plan.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use arbiter_core::config::ExecutorConfig;
use arbiter_core::{
    ActionSpec, ActionTemplate, DecisionId, ExecutorKind, Outcome, OutcomeKind, PlanStep,
    TemplateId,
};
use arbiter_history::Journal;

use crate::action::parse_plan;
use crate::executor::{ExecutorError, ExecutorRegistry};
use crate::oracle::Oracle;
use crate::parse::parse_object;
use crate::prompts::decompose_prompt;
use crate::templates::TemplateLibrary;

/// Where a plan's steps came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "template_id", rename_all = "snake_case")]
pub enum PlanSource {
    Template(TemplateId),
    Novel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub source: PlanSource,
    pub steps: Vec<PlanStep>,
    /// Per attempt of each step.
    pub timeout: Duration,
    /// Extra attempts per step after a transient failure.
    pub max_retries: u32,
}

/// One line of the novel-action log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NovelActionEntry {
    pub timestamp: DateTime<Utc>,
    pub decision_id: DecisionId,
    pub action: ActionSpec,
    pub steps: Vec<PlanStep>,
    /// Why decomposition failed, if it did.
    pub error: Option<String>,
}

pub struct Dispatcher {
    oracle: Arc<dyn Oracle>,
    executors: ExecutorRegistry,
    templates: Arc<TemplateLibrary>,
    novel_log: Journal<NovelActionEntry>,
}

impl Dispatcher {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        executors: ExecutorRegistry,
        templates: Arc<TemplateLibrary>,
        novel_log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            oracle,
            executors,
            templates,
            novel_log: Journal::new(novel_log_path),
        }
    }

    pub fn set_executors(&mut self, executors: ExecutorRegistry) {
        self.executors = executors;
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn novel_log(&self) -> &Journal<NovelActionEntry> {
        &self.novel_log
    }

    /// Build the plan for an action. `Err` carries the reason the action
    /// cannot be planned; the caller records it as a rejected outcome.
    pub async fn plan(
        &self,
        decision_id: DecisionId,
        action: &ActionSpec,
        config: &ExecutorConfig,
    ) -> Result<ExecutionPlan, String> {
        if let Some(template) = self.templates.find_by_action_type(&action.action_type) {
            let steps = instantiate(&template, action)?;
            tracing::debug!(
                decision_id = %decision_id,
                template_id = %template.id,
                steps = steps.len(),
                "Action matched template"
            );
            return Ok(ExecutionPlan {
                source: PlanSource::Template(template.id),
                steps,
                timeout: Duration::from_secs(
                    template.timeout_secs.unwrap_or(config.default_timeout_secs),
                ),
                max_retries: template.max_retries.unwrap_or(config.default_max_retries),
            });
        }

        let (steps, error) = match self.decompose(action, config.max_plan_steps).await {
            Ok(steps) => (steps, None),
            Err(problem) if action.executor != ExecutorKind::Custom => {
                tracing::warn!(
                    decision_id = %decision_id,
                    action_type = %action.action_type,
                    problem = %problem,
                    "Decomposition failed, running action as a single step"
                );
                (vec![single_step(action, action.executor)], Some(problem))
            }
            Err(problem) => (Vec::new(), Some(problem)),
        };

        let entry = NovelActionEntry {
            timestamp: Utc::now(),
            decision_id,
            action: action.clone(),
            steps: steps.clone(),
            error: error.clone(),
        };
        if let Err(e) = self.novel_log.append(&entry) {
            tracing::warn!(decision_id = %decision_id, error = %e, "Could not log novel action");
        }
        tracing::info!(
            decision_id = %decision_id,
            action_type = %action.action_type,
            steps = steps.len(),
            "Novel action planned"
        );

        if steps.is_empty() {
            return Err(format!(
                "custom action `{}` could not be decomposed: {}",
                action.action_type,
                error.unwrap_or_default()
            ));
        }
        Ok(ExecutionPlan {
            source: PlanSource::Novel,
            steps,
            timeout: Duration::from_secs(config.default_timeout_secs),
            max_retries: config.default_max_retries,
        })
    }

    async fn decompose(&self, action: &ActionSpec, max_steps: usize) -> Result<Vec<PlanStep>, String> {
        let available: Vec<ExecutorKind> = ExecutorKind::PRIMITIVE
            .into_iter()
            .filter(|k| self.executors.supports(*k))
            .collect();
        let prompt = decompose_prompt(action, &available, max_steps);
        let text = self
            .oracle
            .complete(&prompt)
            .await
            .map_err(|e| format!("oracle error: {e}"))?;
        let (value, _) = parse_object(&text).ok_or("reply contained no JSON object")?;
        parse_plan(&value, max_steps).map_err(|e| e.to_string())
    }

    /// Run the plan. Transient failures are retried up to
    /// `plan.max_retries` times per step.
    pub async fn execute(&self, decision_id: DecisionId, plan: &ExecutionPlan) -> Outcome {
        let mut attempts_total = 0;
        let mut last_output = String::new();

        for (index, step) in plan.steps.iter().enumerate() {
            let Some(executor) = self.executors.get(step.executor) else {
                return Outcome::new(
                    OutcomeKind::Rejected,
                    format!("step {}: no executor registered for `{}`", index + 1, step.executor),
                    attempts_total,
                );
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                attempts_total += 1;
                match executor.execute(step, plan.timeout).await {
                    Ok(out) => {
                        tracing::debug!(
                            decision_id = %decision_id,
                            step = index + 1,
                            executor = %step.executor,
                            duration_ms = out.duration.as_millis() as u64,
                            "Step completed"
                        );
                        last_output = out.output;
                        break;
                    }
                    Err(e) if e.is_transient() && attempt <= plan.max_retries => {
                        tracing::warn!(
                            decision_id = %decision_id,
                            step = index + 1,
                            attempt,
                            error = %e,
                            "Step failed, retrying"
                        );
                    }
                    Err(e) => {
                        let kind = match e {
                            ExecutorError::Timeout(_) => OutcomeKind::Timeout,
                            ExecutorError::Unavailable(_) => OutcomeKind::Rejected,
                            _ => OutcomeKind::Failed,
                        };
                        tracing::error!(
                            decision_id = %decision_id,
                            step = index + 1,
                            executor = %step.executor,
                            error = %e,
                            "Step failed"
                        );
                        return Outcome::new(
                            kind,
                            format!("step {} ({}) failed: {e}", index + 1, step.description),
                            attempts_total,
                        );
                    }
                }
            }
        }

        Outcome::new(
            OutcomeKind::Success,
            format!(
                "{} step(s) completed: {}",
                plan.steps.len(),
                truncate(last_output.trim(), 200)
            ),
            attempts_total,
        )
    }
}

/// Template steps with the action's parameters applied: `{key}`
/// placeholders in step strings are replaced by the action's string
/// details, and keys a step leaves unset are filled in.
fn instantiate(template: &ActionTemplate, action: &ActionSpec) -> Result<Vec<PlanStep>, String> {
    if template.steps.is_empty() {
        let executor = if action.executor != ExecutorKind::Custom {
            action.executor
        } else {
            template.example_action.executor
        };
        if executor == ExecutorKind::Custom {
            return Err(format!(
                "template `{}` has no steps and no primitive executor",
                template.name
            ));
        }
        return Ok(vec![single_step(action, executor)]);
    }

    Ok(template
        .steps
        .iter()
        .map(|step| {
            let mut details: Map<String, Value> = step
                .details
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, &action.details)))
                .collect();
            for (k, v) in &action.details {
                details.entry(k.clone()).or_insert_with(|| v.clone());
            }
            PlanStep {
                executor: step.executor,
                description: fill(&step.description, &action.details),
                details,
            }
        })
        .collect())
}

fn fill(text: &str, params: &Map<String, Value>) -> String {
    let mut out = text.to_string();
    for (k, v) in params {
        if let Some(value) = v.as_str() {
            out = out.replace(&format!("{{{k}}}"), value);
        }
    }
    out
}

fn substitute(value: &Value, params: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(fill(s, params)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn single_step(action: &ActionSpec, executor: ExecutorKind) -> PlanStep {
    PlanStep {
        executor,
        description: action.description.clone(),
        details: action.details.clone(),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
