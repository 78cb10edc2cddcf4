//! Template similarity scoring.
//!
//! How "similar" a template is to an observation is pluggable; the default
//! is a cheap keyword overlap with bonuses for matching category, type and
//! path prefix.

use std::collections::HashSet;

use arbiter_core::{ActionTemplate, Observation};

pub trait SimilarityScorer: Send + Sync {
    /// Higher is more similar. Scores are only compared to each other.
    fn score(&self, template: &ActionTemplate, observation: &Observation) -> f64;
}

const CATEGORY_BONUS: f64 = 0.3;
const TYPE_BONUS: f64 = 0.1;
const PATH_BONUS: f64 = 0.2;

/// Token Jaccard over template name/trigger/action type versus observation
/// description/path/type.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordScorer;

impl SimilarityScorer for KeywordScorer {
    fn score(&self, template: &ActionTemplate, observation: &Observation) -> f64 {
        let template_tokens = tokens(&[
            &template.name,
            &template.trigger,
            template.action_type(),
        ]);
        let observation_tokens = tokens(&[
            &observation.description,
            observation.path.as_deref().unwrap_or_default(),
            observation.observation_type.as_str(),
        ]);

        let mut score = jaccard(&template_tokens, &observation_tokens);
        if template.category == Some(observation.category) {
            score += CATEGORY_BONUS;
        }
        if template.observation_type == Some(observation.observation_type) {
            score += TYPE_BONUS;
        }
        if let (Some(prefix), Some(path)) = (&template.path_prefix, &observation.path) {
            if path.starts_with(prefix.as_str()) {
                score += PATH_BONUS;
            }
        }
        score
    }
}

fn tokens(texts: &[&str]) -> HashSet<String> {
    texts
        .iter()
        .flat_map(|t| t.split(|c: char| !c.is_alphanumeric()))
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
