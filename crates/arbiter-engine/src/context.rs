//! Context builder: assembles the bounded per-cycle `DecisionContext`.
//!
//! Every sub-fetch (file read, sibling listing, history query, tracker
//! query) is independent. A failing one is logged, noted in
//! `omissions`, and left out; the cycle never aborts here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use arbiter_core::config::ContextConfig;
use arbiter_core::{ActionTemplate, DecisionId, DecisionType, Observation};
use arbiter_history::{DecisionQuery, HistoryStore};

use crate::resources::{ResourcePool, ResourceSnapshot};
use crate::similarity::SimilarityScorer;
use crate::templates::TemplateLibrary;
use crate::tracker::TaskTracker;

/// A past decision as shown to the reasoner.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DecisionSummary {
    pub id: DecisionId,
    pub timestamp: DateTime<Utc>,
    pub decision_type: DecisionType,
    pub confidence: f64,
    pub action_type: Option<String>,
    pub reasoning: String,
    pub outcome_success: Option<bool>,
}

/// Everything the reasoner sees for one cycle. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionContext {
    pub observations: Vec<Observation>,
    pub file_content: Option<String>,
    /// Whether `file_content` was cut at `max_file_bytes`.
    pub truncated: bool,
    pub related_paths: Vec<String>,
    pub similar_observations: Vec<Observation>,
    pub past_decisions: Vec<DecisionSummary>,
    pub active_tasks: Vec<Value>,
    pub active_goals: Vec<Value>,
    pub resources: ResourceSnapshot,
    pub templates: Vec<ActionTemplate>,
    /// Context slices that could not be fetched, with the reason.
    pub omissions: Vec<String>,
}

pub struct ContextBuilder {
    base_dir: PathBuf,
    history: Arc<dyn HistoryStore>,
    templates: Arc<TemplateLibrary>,
    tracker: Arc<dyn TaskTracker>,
    resources: Arc<ResourcePool>,
    scorer: Arc<dyn SimilarityScorer>,
}

impl ContextBuilder {
    /// Relative observation paths and index files resolve against `base_dir`.
    pub fn new(
        base_dir: impl Into<PathBuf>,
        history: Arc<dyn HistoryStore>,
        templates: Arc<TemplateLibrary>,
        tracker: Arc<dyn TaskTracker>,
        resources: Arc<ResourcePool>,
        scorer: Arc<dyn SimilarityScorer>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            history,
            templates,
            tracker,
            resources,
            scorer,
        }
    }

    pub async fn build(&self, batch: &[Observation], config: &ContextConfig) -> DecisionContext {
        let mut omissions = Vec::new();
        let path = batch.iter().find_map(|o| o.path.as_deref());

        let (file_content, truncated) = match path {
            Some(p) => match read_bounded(&self.resolve(p), config.max_file_bytes).await {
                Ok((content, truncated)) => (Some(content), truncated),
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        tracing::debug!(path = %p, "File not present for context");
                    } else {
                        tracing::warn!(path = %p, error = %e, "File read failed, omitting content");
                    }
                    omissions.push(format!("file content of {p}: {e}"));
                    (None, false)
                }
            },
            None => (None, false),
        };

        let related_paths = self.related_paths(path, config, &mut omissions).await;
        let (similar_observations, past_decisions) =
            self.history_slices(batch, config, &mut omissions);

        let (active_tasks, active_goals) = match self.tracker.snapshot().await {
            Ok(state) => (state.tasks, state.goals),
            Err(e) => {
                tracing::warn!(error = %e, "Task tracker query failed, omitting tasks and goals");
                omissions.push(format!("active tasks and goals: {e}"));
                (Vec::new(), Vec::new())
            }
        };

        let templates = match batch.first() {
            Some(primary) => self
                .templates
                .top_k(primary, config.template_top_k, self.scorer.as_ref()),
            None => Vec::new(),
        };

        DecisionContext {
            observations: batch.to_vec(),
            file_content,
            truncated,
            related_paths,
            similar_observations,
            past_decisions,
            active_tasks,
            active_goals,
            resources: self.resources.snapshot(),
            templates,
            omissions,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    /// Siblings of the observed file, then known index files that exist.
    async fn related_paths(
        &self,
        path: Option<&str>,
        config: &ContextConfig,
        omissions: &mut Vec<String>,
    ) -> Vec<String> {
        let mut related = Vec::new();

        if let Some(path) = path {
            let observed = Path::new(path);
            let parent = observed.parent().unwrap_or_else(|| Path::new(""));
            match list_dir(&self.resolve(&parent.to_string_lossy())).await {
                Ok(names) => {
                    let own = observed.file_name().map(|n| n.to_string_lossy().to_string());
                    related.extend(
                        names
                            .into_iter()
                            .filter(|n| Some(n) != own.as_ref())
                            .map(|n| parent.join(n).to_string_lossy().to_string()),
                    );
                }
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "Sibling listing failed");
                    omissions.push(format!("siblings of {path}: {e}"));
                }
            }
        }

        for index in &config.index_files {
            let already = related.iter().any(|r| r == index) || path == Some(index.as_str());
            if !already && tokio::fs::metadata(self.resolve(index)).await.is_ok() {
                related.push(index.clone());
            }
        }

        related.truncate(config.max_related);
        related
    }

    fn history_slices(
        &self,
        batch: &[Observation],
        config: &ContextConfig,
        omissions: &mut Vec<String>,
    ) -> (Vec<Observation>, Vec<DecisionSummary>) {
        let Some(primary) = batch.first() else {
            return (Vec::new(), Vec::new());
        };
        let window = config.history_window;

        let similar = self
            .history
            .list(&DecisionQuery {
                category: Some(primary.category),
                observation_type: Some(primary.observation_type),
                limit: Some(window),
                ..Default::default()
            })
            .map(|records| {
                records
                    .into_iter()
                    .flat_map(|r| r.observations)
                    .filter(|o| batch.iter().all(|b| b.id != o.id))
                    .take(window)
                    .collect()
            });
        let similar = similar.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "History query failed, omitting similar observations");
            omissions.push(format!("similar observations: {e}"));
            Vec::new()
        });

        let past = self
            .history
            .list(&DecisionQuery {
                category: Some(primary.category),
                limit: Some(window),
                ..Default::default()
            })
            .map(|records| {
                records
                    .into_iter()
                    .map(|r| DecisionSummary {
                        id: r.decision.id,
                        timestamp: r.decision.timestamp,
                        decision_type: r.decision.decision_type(),
                        confidence: r.decision.confidence,
                        action_type: r.decision.action().map(|a| a.action_type.clone()),
                        reasoning: r.decision.reasoning,
                        outcome_success: r.decision.outcome_success,
                    })
                    .collect()
            });
        let past = past.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "History query failed, omitting past decisions");
            omissions.push(format!("past decisions: {e}"));
            Vec::new()
        });

        (similar, past)
    }
}

/// Read at most `max_bytes`, cut back to a UTF-8 character boundary.
async fn read_bounded(path: &Path, max_bytes: usize) -> std::io::Result<(String, bool)> {
    let file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::with_capacity(max_bytes.min(64 * 1024) + 1);
    file.take(max_bytes as u64 + 1).read_to_end(&mut buf).await?;

    let truncated = buf.len() > max_bytes;
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated || text.len() > max_bytes {
        let mut cut = max_bytes.min(text.len());
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    Ok((text, truncated))
}

async fn list_dir(dir: &Path) -> std::io::Result<Vec<String>> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::config::ExecutorConfig;
    use arbiter_core::{Category, ObservationId, ObservationType, Urgency};
    use arbiter_history::FileHistoryStore;

    use crate::error::{EngineError, Result as EngineResult};
    use crate::similarity::KeywordScorer;
    use crate::tracker::{NullTracker, TrackerState};

    struct FailingTracker;

    #[async_trait::async_trait]
    impl TaskTracker for FailingTracker {
        async fn snapshot(&self) -> EngineResult<TrackerState> {
            Err(EngineError::Tracker("tracker offline".to_string()))
        }
    }

    fn observation(path: &str) -> Observation {
        Observation {
            id: ObservationId::new(),
            timestamp: Utc::now(),
            observation_type: ObservationType::FileModified,
            source: "fs".to_string(),
            description: format!("file_modified: {path}"),
            urgency: Urgency::Routine,
            category: Category::Knowledge,
            path: Some(path.to_string()),
            content_hash: None,
            metadata: serde_json::Map::new(),
            related_ids: vec![],
            parent_id: None,
            processed: false,
            decision_id: None,
        }
    }

    fn builder(base: &Path, tracker: Arc<dyn TaskTracker>) -> ContextBuilder {
        let history = FileHistoryStore::open(base.join("data")).unwrap();
        ContextBuilder::new(
            base,
            Arc::new(history),
            Arc::new(TemplateLibrary::with_templates(vec![])),
            tracker,
            ResourcePool::new(&ExecutorConfig::default()),
            Arc::new(KeywordScorer),
        )
    }

    #[tokio::test]
    async fn file_content_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("notes/big.md"), "é".repeat(4000)).unwrap();
        std::fs::write(dir.path().join("notes/other.md"), "x").unwrap();
        std::fs::write(dir.path().join("INDEX.md"), "index").unwrap();

        let config = ContextConfig {
            max_file_bytes: 101,
            ..Default::default()
        };
        let ctx = builder(dir.path(), Arc::new(NullTracker))
            .build(&[observation("notes/big.md")], &config)
            .await;

        let content = ctx.file_content.unwrap();
        assert!(ctx.truncated);
        assert!(content.len() <= 101);
        assert_eq!(content.chars().count(), 50);
        assert_eq!(ctx.related_paths, vec!["notes/other.md", "INDEX.md"]);
        assert!(ctx.omissions.is_empty());
    }

    #[tokio::test]
    async fn failures_are_omitted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = builder(dir.path(), Arc::new(FailingTracker))
            .build(&[observation("gone/deleted.md")], &ContextConfig::default())
            .await;

        assert!(ctx.file_content.is_none());
        assert!(ctx.active_tasks.is_empty());
        // File, sibling listing and tracker each left a note.
        assert_eq!(ctx.omissions.len(), 3);
        assert_eq!(ctx.observations.len(), 1);
    }

    #[tokio::test]
    async fn observation_without_path_skips_file_slices() {
        let dir = tempfile::tempdir().unwrap();
        let mut obs = observation("x");
        obs.path = None;
        let ctx = builder(dir.path(), Arc::new(NullTracker))
            .build(&[obs], &ContextConfig::default())
            .await;
        assert!(ctx.file_content.is_none());
        assert!(ctx.related_paths.is_empty());
        assert!(ctx.omissions.is_empty());
        assert!(ctx.resources.memory_available_mb > 0);
    }
}
