//! Action schema: structural validation of oracle-proposed payloads.
//!
//! The action shape is deliberately loose (`type`, `description`, open
//! `details`, `executor`); only the routing field is closed. Normalization
//! accepts the spellings oracles tend to produce and rejects what cannot be
//! routed.

use serde_json::{Map, Value};
use thiserror::Error;

use arbiter_core::config::ReasonerConfig;
use arbiter_core::{ActionSpec, DecisionPayload, DecisionType, ExecutorKind, PlanStep};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Expected a JSON object")]
    NotAnObject,

    #[error("Missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid field `{field}`: {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("Unknown executor `{0}`")]
    UnknownExecutor(String),

    #[error("Plan has {count} steps; at most {max} allowed")]
    TooManySteps { count: usize, max: usize },

    #[error("Plan has no steps")]
    EmptyPlan,
}

/// Normalize an oracle-proposed action object.
pub fn normalize_action(value: &Value) -> Result<ActionSpec, SchemaError> {
    let obj = value.as_object().ok_or(SchemaError::NotAnObject)?;

    let raw_type = str_field(obj, &["type", "action_type", "action"])
        .ok_or(SchemaError::MissingField("type"))?;
    let action_type = normalize_type(raw_type);
    if action_type.is_empty() {
        return Err(SchemaError::InvalidField {
            field: "type",
            message: "empty after normalization".to_string(),
        });
    }

    let executor = parse_executor(obj)?;
    let description = str_field(obj, &["description"])
        .map(str::to_string)
        .unwrap_or_else(|| action_type.replace('_', " "));

    Ok(ActionSpec {
        action_type,
        description,
        details: details_of(obj),
        executor,
        priority: priority_of(obj.get("priority")).unwrap_or(50),
    })
}

/// Parse a step plan: either `{"steps": [...]}` or a bare array.
/// Every step must name a primitive executor.
pub fn parse_plan(value: &Value, max_steps: usize) -> Result<Vec<PlanStep>, SchemaError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(obj) => obj
            .get("steps")
            .and_then(Value::as_array)
            .ok_or(SchemaError::MissingField("steps"))?,
        _ => return Err(SchemaError::NotAnObject),
    };
    if items.is_empty() {
        return Err(SchemaError::EmptyPlan);
    }
    if items.len() > max_steps {
        return Err(SchemaError::TooManySteps {
            count: items.len(),
            max: max_steps,
        });
    }

    items
        .iter()
        .map(|item| {
            let obj = item.as_object().ok_or(SchemaError::NotAnObject)?;
            let executor = parse_executor(obj)?;
            if executor == ExecutorKind::Custom {
                return Err(SchemaError::InvalidField {
                    field: "executor",
                    message: "plan steps must use a primitive executor".to_string(),
                });
            }
            Ok(PlanStep {
                executor,
                description: str_field(obj, &["description"])
                    .unwrap_or_default()
                    .to_string(),
                details: details_of(obj),
            })
        })
        .collect()
}

/// Validate the decide-stage output for the decision type the thresholds
/// selected. Returns the payload and the oracle's reasoning text, if any.
pub fn payload_for(
    selected: DecisionType,
    output: &Value,
    config: &ReasonerConfig,
) -> Result<(DecisionPayload, Option<String>), SchemaError> {
    let obj = output.as_object().ok_or(SchemaError::NotAnObject)?;
    let reasoning = str_field(obj, &["reasoning", "justification"]).map(str::to_string);

    let payload = match selected {
        DecisionType::Act => {
            let action = obj.get("action").ok_or(SchemaError::MissingField("action"))?;
            DecisionPayload::Act {
                action: normalize_action(action)?,
            }
        }
        DecisionType::Wait => {
            let resume_conditions = string_list(obj.get("resume_conditions"));
            DecisionPayload::Wait {
                resume_conditions: if resume_conditions.is_empty() {
                    vec!["new related observations".to_string()]
                } else {
                    resume_conditions
                },
                timeout_secs: Some(
                    obj.get("timeout_secs")
                        .and_then(Value::as_u64)
                        .unwrap_or(config.default_wait_timeout_secs),
                ),
            }
        }
        DecisionType::Investigate => {
            let queries = string_list(obj.get("queries"));
            if queries.is_empty() {
                return Err(SchemaError::MissingField("queries"));
            }
            DecisionPayload::Investigate { queries }
        }
        DecisionType::Escalate => {
            let reason = str_field(obj, &["reason", "escalation_reason"])
                .filter(|r| !r.trim().is_empty())
                .ok_or(SchemaError::MissingField("reason"))?;
            DecisionPayload::Escalate {
                reason: reason.to_string(),
                priority: priority_of(obj.get("priority"))
                    .unwrap_or(config.default_escalation_priority),
            }
        }
    };
    Ok((payload, reasoning))
}

/// snake_case, ASCII alphanumerics and underscores only.
pub fn normalize_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

fn parse_executor(obj: &Map<String, Value>) -> Result<ExecutorKind, SchemaError> {
    let raw = str_field(obj, &["executor", "executor_type"])
        .ok_or(SchemaError::MissingField("executor"))?;
    ExecutorKind::parse(raw).ok_or_else(|| SchemaError::UnknownExecutor(raw.to_string()))
}

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

/// `details` as an open map. A non-object value is kept under `value`.
fn details_of(obj: &Map<String, Value>) -> Map<String, Value> {
    match obj.get("details") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}

fn priority_of(value: Option<&Value>) -> Option<u8> {
    let n = value?.as_f64()?;
    Some(n.clamp(0.0, 100.0).round() as u8)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn novel_action_type_is_accepted() {
        let action = normalize_action(&json!({
            "type": "Code Review With-Suggestions",
            "description": "Review the diff",
            "details": {"path": "src/lib.rs"},
            "executor": "swarm",
            "priority": 140,
        }))
        .unwrap();
        assert_eq!(action.action_type, "code_review_with_suggestions");
        assert_eq!(action.executor, ExecutorKind::Swarm);
        assert_eq!(action.priority, 100);
        assert_eq!(action.details["path"], "src/lib.rs");
    }

    #[test]
    fn unknown_executor_is_rejected() {
        let err = normalize_action(&json!({"type": "x", "executor": "teleporter"})).unwrap_err();
        assert_eq!(err, SchemaError::UnknownExecutor("teleporter".to_string()));
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = normalize_action(&json!({"executor": "script"})).unwrap_err();
        assert_eq!(err, SchemaError::MissingField("type"));
    }

    #[test]
    fn scalar_details_are_wrapped() {
        let action =
            normalize_action(&json!({"type": "note", "executor": "internal", "details": "hi"}))
                .unwrap();
        assert_eq!(action.details["value"], "hi");
        assert_eq!(action.description, "note");
    }

    #[test]
    fn plan_steps_must_be_primitive() {
        let plan = parse_plan(
            &json!({"steps": [
                {"executor": "script", "description": "diff", "details": {"command": "git diff"}},
                {"executor": "task", "description": "review"},
            ]}),
            8,
        )
        .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].executor, ExecutorKind::Task);

        assert!(parse_plan(&json!([{"executor": "custom"}]), 8).is_err());
        assert_eq!(parse_plan(&json!([]), 8).unwrap_err(), SchemaError::EmptyPlan);
        assert!(matches!(
            parse_plan(&json!([{"executor": "script"}, {"executor": "script"}]), 1),
            Err(SchemaError::TooManySteps { count: 2, max: 1 })
        ));
    }

    #[test]
    fn payload_defaults() {
        let config = ReasonerConfig::default();
        let (wait, _) = payload_for(DecisionType::Wait, &json!({}), &config).unwrap();
        assert_eq!(
            wait,
            DecisionPayload::Wait {
                resume_conditions: vec!["new related observations".to_string()],
                timeout_secs: Some(600),
            }
        );

        let (esc, reasoning) = payload_for(
            DecisionType::Escalate,
            &json!({"reason": "ambiguous ownership", "reasoning": "two owners"}),
            &config,
        )
        .unwrap();
        assert_eq!(reasoning.as_deref(), Some("two owners"));
        assert!(matches!(esc, DecisionPayload::Escalate { priority: 25, .. }));

        assert_eq!(
            payload_for(DecisionType::Investigate, &json!({"queries": []}), &config).unwrap_err(),
            SchemaError::MissingField("queries")
        );
        assert_eq!(
            payload_for(DecisionType::Act, &json!({"reasoning": "go"}), &config).unwrap_err(),
            SchemaError::MissingField("action")
        );
    }
}
