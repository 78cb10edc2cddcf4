//! Observation classifier.
//!
//! Turns a [`RawEvent`] into an [`Observation`] with urgency and category
//! assigned. Pure and synchronous: only the event's own fields and metadata
//! are inspected, so classifying the same event twice gives the same result.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use regex::Regex;

use arbiter_core::config::ClassifierConfig;
use arbiter_core::{Category, Observation, ObservationId, ObservationType, RawEvent, Urgency};

use crate::error::{compile_patterns, Result};

pub struct Classifier {
    urgency_overrides: HashMap<ObservationType, Urgency>,
    noise: Vec<Regex>,
    rules: Vec<(Regex, Category)>,
    document_extensions: HashSet<String>,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let mut urgency_overrides = HashMap::new();
        for (name, urgency) in &config.urgency_overrides {
            match ObservationType::parse(name) {
                Some(t) => {
                    urgency_overrides.insert(t, *urgency);
                }
                None => {
                    tracing::warn!(event_type = %name, "Ignoring urgency override for unknown type");
                }
            }
        }

        let patterns: Vec<String> = config
            .category_rules
            .iter()
            .map(|r| r.pattern.clone())
            .collect();
        let rules = compile_patterns(&patterns)?
            .into_iter()
            .zip(config.category_rules.iter().map(|r| r.category))
            .collect();

        Ok(Self {
            urgency_overrides,
            noise: compile_patterns(&config.noise_patterns)?,
            rules,
            document_extensions: config
                .document_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        })
    }

    /// Build a classified observation from a raw event.
    ///
    /// An event type that cannot be coerced is kept as an external event with
    /// ROUTINE urgency and SYSTEM category rather than rejected.
    pub fn classify(&self, event: &RawEvent) -> Observation {
        let path = event.path().map(str::to_string);

        let mut metadata = event.metadata.clone();
        let (observation_type, urgency, category) = match ObservationType::parse(&event.event_type)
        {
            Some(t) => (
                t,
                self.urgency_for(t, path.as_deref()),
                self.category_for(t, path.as_deref()),
            ),
            None => {
                tracing::debug!(event_type = %event.event_type, "Unrecognized event type");
                metadata.insert(
                    "raw_event_type".to_string(),
                    serde_json::Value::String(event.event_type.clone()),
                );
                (ObservationType::ExternalEvent, Urgency::Routine, Category::System)
            }
        };

        let description = if event.description.is_empty() {
            match &path {
                Some(p) => format!("{observation_type}: {p}"),
                None => observation_type.to_string(),
            }
        } else {
            event.description.clone()
        };

        Observation {
            id: ObservationId::new(),
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
            observation_type,
            source: event.source.clone(),
            description,
            urgency,
            category,
            content_hash: metadata_str(&metadata, "content_hash"),
            related_ids: metadata_ids(&metadata, "related_ids"),
            parent_id: metadata_ids(&metadata, "parent_id").into_iter().next(),
            path,
            metadata,
            processed: false,
            decision_id: None,
        }
    }

    /// Type table first (with overrides), then the noise patterns win.
    pub fn urgency_for(&self, observation_type: ObservationType, path: Option<&str>) -> Urgency {
        if let Some(p) = path {
            if self.noise.iter().any(|re| re.is_match(p)) {
                return Urgency::Noise;
            }
        }
        self.urgency_overrides
            .get(&observation_type)
            .copied()
            .unwrap_or_else(|| default_urgency(observation_type))
    }

    /// Path rules, then type fallback, then document extension, then SYSTEM.
    pub fn category_for(&self, observation_type: ObservationType, path: Option<&str>) -> Category {
        if let Some(p) = path {
            if let Some((_, category)) = self.rules.iter().find(|(re, _)| re.is_match(p)) {
                return *category;
            }
        }
        if observation_type.is_task_event() {
            return Category::TaskLifecycle;
        }
        if observation_type.is_process_event() {
            return Category::Execution;
        }
        if let Some(ext) = path.and_then(extension) {
            if self.document_extensions.contains(&ext) {
                return Category::Knowledge;
            }
        }
        Category::System
    }
}

fn default_urgency(observation_type: ObservationType) -> Urgency {
    match observation_type {
        ObservationType::TaskFailed | ObservationType::ProcessFailed => Urgency::Critical,
        ObservationType::FileDeleted | ObservationType::UserEvent => Urgency::Urgent,
        ObservationType::FileCreated
        | ObservationType::FileModified
        | ObservationType::FileMoved
        | ObservationType::TaskQueued
        | ObservationType::TaskCompleted
        | ObservationType::ProcessCompleted
        | ObservationType::ScheduleTriggered
        | ObservationType::ExternalEvent => Urgency::Routine,
        ObservationType::ProcessStarted | ObservationType::TimeElapsed => Urgency::Low,
    }
}

fn extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn metadata_str(metadata: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// A single UUID string or an array of them; unparsable entries are dropped.
fn metadata_ids(
    metadata: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Vec<ObservationId> {
    let parse = |v: &serde_json::Value| {
        v.as_str()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(ObservationId)
    };
    match metadata.get(key) {
        Some(serde_json::Value::Array(items)) => items.iter().filter_map(parse).collect(),
        Some(v) => parse(v).into_iter().collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(&ClassifierConfig::default()).unwrap()
    }

    #[test]
    fn failures_are_critical() {
        let obs = classifier().classify(&RawEvent::new("supervisor", "task_failed", "build failed"));
        assert_eq!(obs.observation_type, ObservationType::TaskFailed);
        assert_eq!(obs.urgency, Urgency::Critical);
        assert_eq!(obs.category, Category::TaskLifecycle);
    }

    #[test]
    fn deletion_is_urgent() {
        let obs = classifier().classify(&RawEvent::file("file_deleted", "knowledge/agents.md"));
        assert_eq!(obs.urgency, Urgency::Urgent);
        assert_eq!(obs.category, Category::Knowledge);
    }

    #[test]
    fn noise_overrides_type_table() {
        let c = classifier();
        for path in ["repo/.git/index", "notes/draft.md.swp", "src/__pycache__/x.pyc", "a.txt~"] {
            let obs = c.classify(&RawEvent::file("file_deleted", path));
            assert_eq!(obs.urgency, Urgency::Noise, "{path}");
        }
    }

    #[test]
    fn path_rules_first_match_wins() {
        let c = classifier();
        let cases = [
            ("inbox/new-article.md", Category::Intake),
            ("kb/INDEX.md", Category::Index),
            ("config/arbiter.toml", Category::Configuration),
            ("arbiter-data/patterns.json", Category::SelfReferential),
            ("lessons/2024.md", Category::LearningSignal),
            ("random/file.bin", Category::System),
            ("random/essay.md", Category::Knowledge),
        ];
        for (path, expected) in cases {
            let obs = c.classify(&RawEvent::file("file_modified", path));
            assert_eq!(obs.category, expected, "{path}");
        }
    }

    #[test]
    fn non_file_events_fall_back_to_type() {
        let c = classifier();
        assert_eq!(
            c.classify(&RawEvent::new("supervisor", "process_completed", "done")).category,
            Category::Execution
        );
        let tick = c.classify(&RawEvent::new("timer", "time_elapsed", "tick"));
        assert_eq!(tick.category, Category::System);
        assert_eq!(tick.urgency, Urgency::Low);
    }

    #[test]
    fn unknown_type_defaults_to_routine_system() {
        let obs = classifier().classify(&RawEvent::new("webhook", "galaxy_collapsed", "?"));
        assert_eq!(obs.observation_type, ObservationType::ExternalEvent);
        assert_eq!(obs.urgency, Urgency::Routine);
        assert_eq!(obs.category, Category::System);
        assert_eq!(obs.metadata["raw_event_type"], "galaxy_collapsed");
    }

    #[test]
    fn classification_is_idempotent() {
        let c = classifier();
        let event = RawEvent::file("File-Modified", "staging/report.pdf")
            .with_metadata("content_hash", serde_json::json!("abc"));
        let a = c.classify(&event);
        let b = c.classify(&event);
        assert_eq!((a.urgency, a.category), (b.urgency, b.category));
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.content_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn overrides_apply_by_type_name() {
        let mut config = ClassifierConfig::default();
        config
            .urgency_overrides
            .insert("time_elapsed".to_string(), Urgency::Urgent);
        let c = Classifier::new(&config).unwrap();
        assert_eq!(c.urgency_for(ObservationType::TimeElapsed, None), Urgency::Urgent);
    }

    #[test]
    fn invalid_rule_is_reported() {
        let mut config = ClassifierConfig::default();
        config.noise_patterns.push("([".to_string());
        assert!(Classifier::new(&config).is_err());
    }
}
