//! Safety checker: the pre-execution gate.
//!
//! Runs on every action and every derived plan step, whatever the
//! confidence. Forbidden patterns reject unconditionally. Protected paths
//! reject unless the action carries an approved escalation ID in
//! `details.confirmation`. Network access is rejected when restricted.
//! A rejected action gets one sanitization pass (stripping configured flags)
//! and is re-checked; the caller escalates anything still rejected.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use arbiter_core::config::SafetyConfig;
use arbiter_core::{ActionSpec, DecisionId, ExecutorKind, PlanStep};

use crate::error::{compile_patterns, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    Allowed,
    Rejected { reason: String },
}

/// Result of [`SafetyChecker::gate`].
#[derive(Debug, Clone, PartialEq)]
pub enum GateResult {
    Passed { action: ActionSpec, sanitized: bool },
    Rejected { reason: String },
}

pub struct SafetyChecker {
    forbidden: Vec<Regex>,
    protected_paths: Vec<String>,
    restrict_network: bool,
    network: Vec<Regex>,
    strip_flags: Vec<String>,
}

impl SafetyChecker {
    pub fn new(config: &SafetyConfig) -> Result<Self> {
        Ok(Self {
            forbidden: compile_patterns(&config.forbidden_patterns)?,
            protected_paths: config.protected_paths.clone(),
            restrict_network: config.restrict_network,
            network: compile_patterns(&config.network_patterns)?,
            strip_flags: config.strip_flags.clone(),
        })
    }

    pub fn check(&self, action: &ActionSpec, approved: &HashSet<DecisionId>) -> SafetyVerdict {
        let mut texts = vec![action.action_type.as_str(), action.description.as_str()];
        collect_strings(&action.details, &mut texts);
        self.check_texts(action.executor, &texts, &action.details, approved)
    }

    pub fn check_step(&self, step: &PlanStep, approved: &HashSet<DecisionId>) -> SafetyVerdict {
        let mut texts = vec![step.description.as_str()];
        collect_strings(&step.details, &mut texts);
        self.check_texts(step.executor, &texts, &step.details, approved)
    }

    /// Check, then on rejection sanitize once and re-check.
    pub fn gate(&self, action: &ActionSpec, approved: &HashSet<DecisionId>) -> GateResult {
        let reason = match self.check(action, approved) {
            SafetyVerdict::Allowed => {
                return GateResult::Passed {
                    action: action.clone(),
                    sanitized: false,
                }
            }
            SafetyVerdict::Rejected { reason } => reason,
        };

        if let Some(sanitized) = self.sanitize(action) {
            if self.check(&sanitized, approved) == SafetyVerdict::Allowed {
                tracing::warn!(
                    action_type = %action.action_type,
                    reason = %reason,
                    "Action sanitized past safety rejection"
                );
                return GateResult::Passed {
                    action: sanitized,
                    sanitized: true,
                };
            }
        }

        tracing::warn!(action_type = %action.action_type, reason = %reason, "Action rejected by safety checker");
        GateResult::Rejected { reason }
    }

    /// Strip configured flags from the description and every string in
    /// `details`. `None` if nothing changed.
    pub fn sanitize(&self, action: &ActionSpec) -> Option<ActionSpec> {
        let mut changed = false;
        let mut out = action.clone();
        out.description = self.strip(&action.description, &mut changed);
        for value in out.details.values_mut() {
            self.strip_value(value, &mut changed);
        }
        changed.then_some(out)
    }

    fn check_texts(
        &self,
        executor: ExecutorKind,
        texts: &[&str],
        details: &serde_json::Map<String, Value>,
        approved: &HashSet<DecisionId>,
    ) -> SafetyVerdict {
        for text in texts {
            if let Some(re) = self.forbidden.iter().find(|re| re.is_match(text)) {
                return SafetyVerdict::Rejected {
                    reason: format!("forbidden pattern `{}` matched", re.as_str()),
                };
            }
        }

        if !is_confirmed(details, approved) {
            for text in texts {
                if let Some(prefix) = self
                    .protected_paths
                    .iter()
                    .find(|p| touches_prefix(text, p))
                {
                    return SafetyVerdict::Rejected {
                        reason: format!("touches protected path `{prefix}` without confirmation"),
                    };
                }
            }
        }

        if self.restrict_network {
            if executor == ExecutorKind::Http {
                return SafetyVerdict::Rejected {
                    reason: "network access is restricted".to_string(),
                };
            }
            for text in texts {
                if let Some(re) = self.network.iter().find(|re| re.is_match(text)) {
                    return SafetyVerdict::Rejected {
                        reason: format!("network access is restricted (`{}`)", re.as_str()),
                    };
                }
            }
        }

        SafetyVerdict::Allowed
    }

    fn strip(&self, text: &str, changed: &mut bool) -> String {
        if !self.strip_flags.iter().any(|f| text.contains(f.as_str())) {
            return text.to_string();
        }
        let kept: Vec<&str> = text
            .split_whitespace()
            .filter(|token| !self.strip_flags.iter().any(|f| f == token))
            .collect();
        let stripped = kept.join(" ");
        if stripped != text {
            *changed = true;
        }
        stripped
    }

    fn strip_value(&self, value: &mut Value, changed: &mut bool) {
        match value {
            Value::String(s) => *s = self.strip(s, changed),
            Value::Array(items) => items.iter_mut().for_each(|v| self.strip_value(v, changed)),
            Value::Object(map) => map.values_mut().for_each(|v| self.strip_value(v, changed)),
            _ => {}
        }
    }
}

/// `details.confirmation` names an approved escalation.
fn is_confirmed(details: &serde_json::Map<String, Value>, approved: &HashSet<DecisionId>) -> bool {
    details
        .get("confirmation")
        .and_then(Value::as_str)
        .and_then(|s| uuid::Uuid::parse_str(s.trim()).ok())
        .is_some_and(|id| approved.contains(&DecisionId(id)))
}

fn collect_strings<'a>(details: &'a serde_json::Map<String, Value>, out: &mut Vec<&'a str>) {
    fn walk<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
        match value {
            Value::String(s) => out.push(s),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    details.values().for_each(|v| walk(v, out));
}

/// Whether any token of `text` lies under `prefix`. Absolute and home
/// prefixes must start the token; relative ones (".git/") may appear as a
/// path component anywhere.
fn touches_prefix(text: &str, prefix: &str) -> bool {
    let separators = |c: char| {
        c.is_whitespace()
            || matches!(
                c,
                '"' | '\'' | '=' | ',' | ';' | '(' | ')' | '`' | '>' | '<' | '|' | '&' | '{' | '}'
            )
    };
    text.split(separators).filter(|t| !t.is_empty()).any(|token| {
        let as_dir = format!("{}/", token.trim_end_matches('/'));
        if prefix.starts_with('/') || prefix.starts_with('~') {
            as_dir.starts_with(prefix)
        } else {
            as_dir.starts_with(prefix) || as_dir.contains(&format!("/{prefix}"))
        }
    })
}
