//! Decision reasoner: the five-stage pipeline against the oracle.
//!
//! Confidence starts at 0.5. Stages 1–4 each contribute a clamped delta;
//! the decision type is then fixed by the thresholds (using the
//! significance reported by stage 1) and stage 5 asks the oracle for that
//! type's payload. Any stage whose reply still fails to parse or validate
//! after the bounded retries ends the cycle with a safe-default WAIT at
//! confidence 0.0.

use std::sync::Arc;

use serde_json::Value;

use arbiter_core::config::{ReasonerConfig, Thresholds};
use arbiter_core::{Decision, DecisionPayload, DecisionType, ReasoningStage};
use arbiter_history::TraceRecorder;

use crate::action::payload_for;
use crate::context::DecisionContext;
use crate::oracle::Oracle;
use crate::parse::parse_object;
use crate::prompts::{decide_prompt, render_context, retry_suffix, stage_prompt};

pub const SEED_CONFIDENCE: f64 = 0.5;

/// The reasoner's output for one cycle, before calibration.
#[derive(Debug, Clone)]
pub struct Reasoned {
    pub decision: Decision,
    /// Significance reported by the observe stage, lowercased.
    pub significance: Option<String>,
    /// The oracle never produced usable output; this is the fallback WAIT.
    pub safe_default: bool,
}

/// Pick the decision type from accumulated confidence.
pub fn select_decision_type(confidence: f64, critical: bool, thresholds: &Thresholds) -> DecisionType {
    let act = if critical {
        thresholds.act_critical
    } else {
        thresholds.act
    };
    if confidence >= act {
        DecisionType::Act
    } else if confidence >= thresholds.investigate {
        DecisionType::Investigate
    } else if confidence >= thresholds.wait {
        DecisionType::Wait
    } else {
        DecisionType::Escalate
    }
}

struct Answer<T> {
    parsed: T,
    output: Value,
    attempts: u32,
}

struct Failure {
    problem: String,
    attempts: u32,
}

pub struct Reasoner {
    oracle: Arc<dyn Oracle>,
}

impl Reasoner {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self { oracle }
    }

    pub async fn reason(
        &self,
        ctx: &DecisionContext,
        thresholds: &Thresholds,
        config: &ReasonerConfig,
    ) -> Reasoned {
        let context = render_context(ctx);
        let ids = ctx.observations.iter().map(|o| o.id).collect();
        let mut trace = TraceRecorder::new(ids, SEED_CONFIDENCE);
        let mut significance = None;

        for stage in &ReasoningStage::ORDER[..4] {
            let prompt = stage_prompt(*stage, &context, trace.steps());
            let answer = self
                .ask(&prompt, config.max_parse_retries, |v| validate_stage(*stage, v))
                .await;
            let answer = match answer {
                Ok(answer) => answer,
                Err(failure) => return safe_default(trace, *stage, failure, config),
            };

            let (min, max) = stage.delta_range();
            let delta = answer.parsed.clamp(min, max);
            if *stage == ReasoningStage::Observe {
                significance = answer
                    .output
                    .get("significance")
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_ascii_lowercase());
            }
            let step = trace.record(*stage, answer.output, delta, answer.attempts, None);
            tracing::debug!(
                stage = %step.stage,
                delta = step.confidence_delta,
                confidence = step.confidence_after,
                attempts = step.attempts,
                "Reasoning stage complete"
            );
        }

        let critical = significance.as_deref() == Some("critical");
        let selected = select_decision_type(trace.confidence(), critical, thresholds);
        let prompt = decide_prompt(&context, trace.steps(), selected, trace.confidence());
        let answer = self
            .ask(&prompt, config.max_parse_retries, |v| {
                payload_for(selected, v, config).map_err(|e| e.to_string())
            })
            .await;
        let answer = match answer {
            Ok(answer) => answer,
            Err(failure) => return safe_default(trace, ReasoningStage::Decide, failure, config),
        };

        let (payload, reasoning) = answer.parsed;
        let reasoning = reasoning
            .or_else(|| {
                trace.steps().first().and_then(|s| {
                    s.output.get("summary").and_then(Value::as_str).map(String::from)
                })
            })
            .unwrap_or_else(|| format!("{selected} at confidence {:.2}", trace.confidence()));
        trace.record(ReasoningStage::Decide, answer.output, 0.0, answer.attempts, None);

        Reasoned {
            decision: trace.finalize(payload, &reasoning),
            significance,
            safe_default: false,
        }
    }

    /// One oracle exchange with bounded re-prompting. Transport errors and
    /// unusable replies both spend an attempt.
    async fn ask<T>(
        &self,
        prompt: &str,
        retries: u32,
        validate: impl Fn(&Value) -> Result<T, String>,
    ) -> Result<Answer<T>, Failure> {
        let mut problem = String::new();
        let mut attempts = 0;

        while attempts <= retries {
            attempts += 1;
            let request = if attempts == 1 {
                prompt.to_string()
            } else {
                format!("{prompt}{}", retry_suffix(&problem))
            };

            let text = match self.oracle.complete(&request).await {
                Ok(text) => text,
                Err(e) => {
                    problem = format!("oracle error: {e}");
                    tracing::warn!(attempt = attempts, error = %e, "Oracle call failed");
                    continue;
                }
            };
            let Some((output, strategy)) = parse_object(&text) else {
                problem = "reply contained no JSON object".to_string();
                tracing::warn!(attempt = attempts, "Oracle reply was not parseable");
                continue;
            };
            match validate(&output) {
                Ok(parsed) => {
                    tracing::debug!(attempt = attempts, strategy = ?strategy, "Oracle reply parsed");
                    return Ok(Answer {
                        parsed,
                        output,
                        attempts,
                    });
                }
                Err(message) => {
                    tracing::warn!(attempt = attempts, problem = %message, "Oracle reply failed validation");
                    problem = message;
                }
            }
        }

        Err(Failure { problem, attempts })
    }
}

/// Structural check for stages 1–4; returns the stage's confidence delta.
fn validate_stage(stage: ReasoningStage, output: &Value) -> Result<f64, String> {
    let required: &[&str] = match stage {
        ReasoningStage::Observe => &["summary"],
        ReasoningStage::Categorize => &["intent"],
        ReasoningStage::Evaluate => &["options"],
        ReasoningStage::MatchPattern | ReasoningStage::Decide => &[],
    };
    if let Some(missing) = required.iter().find(|k| output.get(**k).is_none()) {
        return Err(format!("missing field `{missing}`"));
    }
    if stage == ReasoningStage::Evaluate && !output["options"].is_array() {
        return Err("`options` must be an array".to_string());
    }
    match output.get("confidence_delta") {
        None | Some(Value::Null) => Ok(0.0),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| "`confidence_delta` must be a number".to_string()),
    }
}

fn safe_default(
    mut trace: TraceRecorder,
    stage: ReasoningStage,
    failure: Failure,
    config: &ReasonerConfig,
) -> Reasoned {
    tracing::warn!(
        decision_id = %trace.id(),
        stage = %stage,
        attempts = failure.attempts,
        problem = %failure.problem,
        "Oracle output unusable, falling back to safe-default WAIT"
    );
    trace.force_confidence(0.0);
    trace.record(
        stage,
        Value::Null,
        0.0,
        failure.attempts,
        Some(format!(
            "parse failure after {} attempt(s): {}",
            failure.attempts, failure.problem
        )),
    );
    let payload = DecisionPayload::Wait {
        resume_conditions: vec!["new related observations".to_string()],
        timeout_secs: Some(config.default_wait_timeout_secs),
    };
    let reasoning = format!("Safe default: the {stage} stage produced no usable output");
    Reasoned {
        decision: trace.finalize(payload, &reasoning),
        significance: None,
        safe_default: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    use arbiter_core::{Category, Observation, ObservationId, ObservationType, Urgency};
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::oracle::OracleError;
    use crate::resources::ResourceSnapshot;

    struct Queued {
        replies: Mutex<VecDeque<Result<String, OracleError>>>,
        calls: Mutex<u32>,
    }

    impl Queued {
        fn new(replies: Vec<Result<String, OracleError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Oracle for Queued {
        async fn complete(&self, _prompt: &str) -> Result<String, OracleError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("no more replies".to_string()))
        }
    }

    fn ok(text: &str) -> Result<String, OracleError> {
        Ok(text.to_string())
    }

    fn context() -> DecisionContext {
        DecisionContext {
            observations: vec![Observation {
                id: ObservationId::new(),
                timestamp: Utc::now(),
                observation_type: ObservationType::FileModified,
                source: "fs".to_string(),
                description: "file_modified: notes/a.md".to_string(),
                urgency: Urgency::Routine,
                category: Category::Knowledge,
                path: Some("notes/a.md".to_string()),
                content_hash: None,
                metadata: serde_json::Map::new(),
                related_ids: vec![],
                parent_id: None,
                processed: false,
                decision_id: None,
            }],
            file_content: None,
            truncated: false,
            related_paths: vec![],
            similar_observations: vec![],
            past_decisions: vec![],
            active_tasks: vec![],
            active_goals: vec![],
            resources: ResourceSnapshot {
                slots: BTreeMap::new(),
                memory_available_mb: 0,
                cost_available: 0.0,
            },
            templates: vec![],
            omissions: vec![],
        }
    }

    fn stages(deltas: [f64; 4], significance: &str) -> Vec<Result<String, OracleError>> {
        vec![
            ok(&format!(
                r#"{{"summary": "note edited", "significance": "{significance}", "confidence_delta": {}}}"#,
                deltas[0]
            )),
            ok(&format!(
                r#"{{"intent": "update", "domain": "notes", "action_required": true, "confidence_delta": {}}}"#,
                deltas[1]
            )),
            ok(&format!(
                r#"{{"matches": [], "deviation": "none", "confidence_delta": {}}}"#,
                deltas[2]
            )),
            ok(&format!(
                r#"{{"options": [], "recommended": "ACT", "confidence_delta": {}}}"#,
                deltas[3]
            )),
        ]
    }

    #[test]
    fn thresholds_select_type() {
        let t = Thresholds::default();
        assert_eq!(select_decision_type(0.72, false, &t), DecisionType::Act);
        assert_eq!(select_decision_type(0.72, true, &t), DecisionType::Investigate);
        assert_eq!(select_decision_type(0.90, true, &t), DecisionType::Act);
        assert_eq!(select_decision_type(0.50, false, &t), DecisionType::Investigate);
        assert_eq!(select_decision_type(0.30, false, &t), DecisionType::Wait);
        assert_eq!(select_decision_type(0.29, false, &t), DecisionType::Escalate);
    }

    #[tokio::test]
    async fn five_stages_recorded_with_clamped_deltas() {
        let mut replies = stages([0.5, 0.15, 0.2, 0.15], "normal");
        replies.push(ok(
            r#"{"reasoning": "index is stale", "action": {"type": "rebuild_index", "executor": "script", "details": {"command": "make index"}}}"#,
        ));
        let reasoner = Reasoner::new(Queued::new(replies));
        let out = reasoner
            .reason(&context(), &Thresholds::default(), &ReasonerConfig::default())
            .await;

        assert!(!out.safe_default);
        let d = out.decision;
        assert_eq!(d.steps.len(), 5);
        // 0.5 + 0.2 (clamped from 0.5) + 0.15 + 0.2 + 0.15
        assert!((d.raw_confidence - 1.0).abs() < 1e-9);
        assert!((d.steps[0].confidence_delta - 0.2).abs() < 1e-9);
        assert_eq!(d.decision_type(), DecisionType::Act);
        assert_eq!(d.action().unwrap().action_type, "rebuild_index");
        assert_eq!(d.reasoning, "index is stale");
        assert_eq!(d.steps[4].stage, ReasoningStage::Decide);
    }

    #[tokio::test]
    async fn fenced_reply_is_accepted() {
        let mut replies = stages([0.0, 0.0, 0.0, 0.0], "low");
        replies[0] = ok("Here you go:\n```json\n{\"summary\": \"edit\", \"confidence_delta\": 0.0}\n```\nThanks.");
        replies.push(ok(r#"{"queries": ["who edited it?"]}"#));
        let oracle = Queued::new(replies);
        let out = Reasoner::new(oracle.clone())
            .reason(&context(), &Thresholds::default(), &ReasonerConfig::default())
            .await;
        assert!(!out.safe_default);
        assert_eq!(out.decision.decision_type(), DecisionType::Investigate);
        assert_eq!(oracle.calls(), 5);
        assert_eq!(out.significance, None);
    }

    #[tokio::test]
    async fn one_retry_then_success() {
        let mut replies = stages([0.0, 0.0, 0.0, 0.0], "normal");
        replies.insert(1, ok("I think the intent is unclear."));
        replies.push(ok(r#"{"queries": ["what changed?"]}"#));
        let oracle = Queued::new(replies);
        let out = Reasoner::new(oracle.clone())
            .reason(&context(), &Thresholds::default(), &ReasonerConfig::default())
            .await;
        assert!(!out.safe_default);
        assert_eq!(out.decision.steps[1].attempts, 2);
        assert_eq!(oracle.calls(), 6);
    }

    #[tokio::test]
    async fn exhausted_retries_give_safe_default_wait() {
        let replies = vec![
            ok("prose only"),
            Err(OracleError::Timeout(120)),
        ];
        let oracle = Queued::new(replies);
        let out = Reasoner::new(oracle.clone())
            .reason(&context(), &Thresholds::default(), &ReasonerConfig::default())
            .await;

        assert!(out.safe_default);
        assert_eq!(oracle.calls(), 2);
        let d = out.decision;
        assert_eq!(d.decision_type(), DecisionType::Wait);
        assert_eq!(d.raw_confidence, 0.0);
        assert_eq!(d.steps.len(), 1);
        assert!(d.steps[0].note.as_deref().unwrap().contains("parse failure"));
        assert_eq!(d.steps[0].output, Value::Null);
    }

    #[tokio::test]
    async fn invalid_payload_for_selected_type_falls_back() {
        let mut replies = stages([0.2, 0.15, 0.2, 0.15], "normal");
        // ACT selected, but the action names an unknown executor twice.
        replies.push(ok(r#"{"action": {"type": "x", "executor": "teleporter"}}"#));
        replies.push(ok(r#"{"action": {"type": "x", "executor": "teleporter"}}"#));
        let out = Reasoner::new(Queued::new(replies))
            .reason(&context(), &Thresholds::default(), &ReasonerConfig::default())
            .await;
        assert!(out.safe_default);
        assert_eq!(out.decision.steps.len(), 5);
        assert_eq!(out.decision.steps[4].stage, ReasoningStage::Decide);
        assert_eq!(out.decision.decision_type(), DecisionType::Wait);
    }

    #[tokio::test]
    async fn critical_significance_raises_act_bar() {
        let mut replies = stages([0.1, 0.1, 0.05, 0.0], "CRITICAL");
        replies.push(ok(r#"{"queries": ["is the failure recurring?"]}"#));
        let out = Reasoner::new(Queued::new(replies))
            .reason(&context(), &Thresholds::default(), &ReasonerConfig::default())
            .await;
        assert_eq!(out.significance.as_deref(), Some("critical"));
        // 0.75 would be ACT normally; critical needs 0.85.
        assert_eq!(out.decision.decision_type(), DecisionType::Investigate);
    }
}
