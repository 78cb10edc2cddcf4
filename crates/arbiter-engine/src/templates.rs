//! Action template library.
//!
//! Layout:
//! ```text
//! {root}/
//!   *.json            static templates (hand-written)
//!   learned/{id}.json templates learned from successful novel actions
//! ```
//!
//! Templates are worked examples for the reasoner and, for recognized
//! action types, the dispatcher's fast path. Only `usage_count` and
//! `success_rate` change after a template is created.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use arbiter_core::{ActionTemplate, Observation, TemplateId};

use crate::error::Result;
use crate::similarity::SimilarityScorer;

struct Entry {
    template: ActionTemplate,
    path: Option<PathBuf>,
}

type Fingerprint = Vec<(PathBuf, Option<SystemTime>)>;

pub struct TemplateLibrary {
    root: Option<PathBuf>,
    entries: RwLock<Vec<Entry>>,
    fingerprint: RwLock<Fingerprint>,
}

impl TemplateLibrary {
    /// Load every template under `root`, creating the directories if needed.
    /// Unreadable files are skipped with a warning.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("learned"))?;
        let (entries, fingerprint) = read_library(&root)?;
        tracing::info!(
            root = %root.display(),
            templates = entries.len(),
            "Template library loaded"
        );
        Ok(Self {
            root: Some(root),
            entries: RwLock::new(entries),
            fingerprint: RwLock::new(fingerprint),
        })
    }

    /// An in-memory library; nothing is persisted.
    pub fn with_templates(templates: Vec<ActionTemplate>) -> Self {
        Self {
            root: None,
            entries: RwLock::new(
                templates
                    .into_iter()
                    .map(|template| Entry {
                        template,
                        path: None,
                    })
                    .collect(),
            ),
            fingerprint: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn all(&self) -> Vec<ActionTemplate> {
        self.read().iter().map(|e| e.template.clone()).collect()
    }

    pub fn get(&self, id: TemplateId) -> Option<ActionTemplate> {
        self.read()
            .iter()
            .find(|e| e.template.id == id)
            .map(|e| e.template.clone())
    }

    /// The best-performing template for an action type, if any.
    pub fn find_by_action_type(&self, action_type: &str) -> Option<ActionTemplate> {
        self.read()
            .iter()
            .map(|e| &e.template)
            .filter(|t| t.action_type() == action_type)
            .max_by(|a, b| {
                a.success_rate
                    .total_cmp(&b.success_rate)
                    .then(a.usage_count.cmp(&b.usage_count))
            })
            .cloned()
    }

    /// The `k` templates most similar to `observation`, best first.
    pub fn top_k(
        &self,
        observation: &Observation,
        k: usize,
        scorer: &dyn SimilarityScorer,
    ) -> Vec<ActionTemplate> {
        let entries = self.read();
        let mut scored: Vec<(f64, &ActionTemplate)> = entries
            .iter()
            .map(|e| (scorer.score(&e.template, observation), &e.template))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(k).map(|(_, t)| t.clone()).collect()
    }

    /// Add a learned template and persist it under `learned/`. Returns false
    /// if a template with the same ID already exists.
    pub fn add_learned(&self, template: ActionTemplate) -> Result<bool> {
        let mut entries = self.write();
        if entries.iter().any(|e| e.template.id == template.id) {
            return Ok(false);
        }
        let path = self
            .root
            .as_ref()
            .map(|root| root.join("learned").join(format!("{}.json", template.id.0)));
        if let Some(path) = &path {
            write_template(path, &template)?;
        }
        tracing::info!(
            template_id = %template.id,
            action_type = %template.action_type(),
            "Learned new action template"
        );
        entries.push(Entry { template, path });
        drop(entries);
        self.refresh_fingerprint();
        Ok(true)
    }

    /// Fold one usage into a template's statistics and persist them.
    /// Returns false for an unknown ID.
    pub fn record_usage(&self, id: TemplateId, success: bool) -> Result<bool> {
        let mut entries = self.write();
        let Some(entry) = entries.iter_mut().find(|e| e.template.id == id) else {
            return Ok(false);
        };
        entry.template.record_usage(success);
        if let Some(path) = &entry.path {
            write_template(path, &entry.template)?;
        }
        tracing::debug!(
            template_id = %id,
            usage_count = entry.template.usage_count,
            success_rate = entry.template.success_rate,
            "Template usage recorded"
        );
        drop(entries);
        self.refresh_fingerprint();
        Ok(true)
    }

    /// Re-read the library if any file was added, removed or modified since
    /// the last load. Returns true if it reloaded.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let Some(root) = &self.root else {
            return Ok(false);
        };
        let current = fingerprint(root)?;
        if *self.fingerprint.read().unwrap_or_else(|p| p.into_inner()) == current {
            return Ok(false);
        }
        let (entries, fingerprint) = read_library(root)?;
        tracing::info!(templates = entries.len(), "Template library reloaded");
        *self.write() = entries;
        *self.fingerprint.write().unwrap_or_else(|p| p.into_inner()) = fingerprint;
        Ok(true)
    }

    fn refresh_fingerprint(&self) {
        if let Some(root) = &self.root {
            match fingerprint(root) {
                Ok(fp) => *self.fingerprint.write().unwrap_or_else(|p| p.into_inner()) = fp,
                Err(e) => tracing::warn!(error = %e, "Could not fingerprint template library"),
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn library_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = json_files(root)?;
    files.extend(json_files(&root.join("learned"))?);
    Ok(files)
}

fn fingerprint(root: &Path) -> Result<Fingerprint> {
    Ok(library_files(root)?
        .into_iter()
        .map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok();
            (p, modified)
        })
        .collect())
}

fn read_library(root: &Path) -> Result<(Vec<Entry>, Fingerprint)> {
    let mut entries = Vec::new();
    for path in library_files(root)? {
        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                serde_json::from_str::<ActionTemplate>(&text).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(template) => entries.push(Entry {
                template,
                path: Some(path),
            }),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "Skipping unreadable template")
            }
        }
    }
    Ok((entries, fingerprint(root)?))
}

fn write_template(path: &Path, template: &ActionTemplate) -> Result<()> {
    let json = serde_json::to_string_pretty(template)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::KeywordScorer;
    use arbiter_core::{
        ActionSpec, Category, ExecutorKind, ObservationId, ObservationType, TemplateOrigin,
        Urgency,
    };
    use chrono::Utc;

    fn template(action_type: &str, origin: TemplateOrigin) -> ActionTemplate {
        ActionTemplate {
            id: TemplateId::new(),
            name: action_type.replace('_', " "),
            version: 1,
            origin,
            trigger: "index file changed".to_string(),
            category: Some(Category::Index),
            observation_type: Some(ObservationType::FileModified),
            path_prefix: None,
            example_reasoning: "stale index".to_string(),
            example_action: ActionSpec {
                action_type: action_type.to_string(),
                description: "do it".to_string(),
                details: serde_json::Map::new(),
                executor: ExecutorKind::Script,
                priority: 50,
            },
            example_outcome: "done".to_string(),
            steps: vec![],
            timeout_secs: None,
            max_retries: None,
            usage_count: 0,
            success_rate: 0.0,
            created_at: Utc::now(),
        }
    }

    fn observation() -> Observation {
        Observation {
            id: ObservationId::new(),
            timestamp: Utc::now(),
            observation_type: ObservationType::FileModified,
            source: "fs".to_string(),
            description: "index changed".to_string(),
            urgency: Urgency::Routine,
            category: Category::Index,
            path: Some("INDEX.md".to_string()),
            content_hash: None,
            metadata: serde_json::Map::new(),
            related_ids: vec![],
            parent_id: None,
            processed: false,
            decision_id: None,
        }
    }

    #[test]
    fn static_templates_load_and_bad_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let t = template("rebuild_index", TemplateOrigin::Static);
        fs::write(
            dir.path().join("rebuild.json"),
            serde_json::to_string(&t).unwrap(),
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), "{ nope").unwrap();
        fs::write(dir.path().join("README.md"), "not a template").unwrap();

        let lib = TemplateLibrary::load(dir.path()).unwrap();
        assert_eq!(lib.len(), 1);
        assert_eq!(lib.find_by_action_type("rebuild_index").unwrap().id, t.id);
        assert!(lib.find_by_action_type("unknown").is_none());
    }

    #[test]
    fn learned_templates_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let learned = template("code_review_with_suggestions", TemplateOrigin::Learned);
        {
            let lib = TemplateLibrary::load(dir.path()).unwrap();
            assert!(lib.add_learned(learned.clone()).unwrap());
            assert!(!lib.add_learned(learned.clone()).unwrap());
            assert!(lib.record_usage(learned.id, true).unwrap());
        }
        assert!(dir
            .path()
            .join("learned")
            .join(format!("{}.json", learned.id.0))
            .exists());

        let lib = TemplateLibrary::load(dir.path()).unwrap();
        let loaded = lib.get(learned.id).unwrap();
        assert_eq!(loaded.usage_count, 1);
        assert_eq!(loaded.example_action, learned.example_action);
    }

    #[test]
    fn reload_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let lib = TemplateLibrary::load(dir.path()).unwrap();
        assert!(!lib.reload_if_changed().unwrap());

        let t = template("rebuild_index", TemplateOrigin::Static);
        fs::write(dir.path().join("new.json"), serde_json::to_string(&t).unwrap()).unwrap();
        assert!(lib.reload_if_changed().unwrap());
        assert_eq!(lib.len(), 1);
    }

    #[test]
    fn top_k_is_bounded_and_ordered() {
        let mut unrelated = template("send_report", TemplateOrigin::Static);
        unrelated.category = Some(Category::System);
        unrelated.observation_type = None;
        unrelated.trigger = "weekly".to_string();
        let lib = TemplateLibrary::with_templates(vec![
            unrelated,
            template("rebuild_index", TemplateOrigin::Static),
            template("refresh_index", TemplateOrigin::Static),
        ]);
        let top = lib.top_k(&observation(), 2, &KeywordScorer);
        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|t| t.action_type() != "send_report"));
    }

    #[test]
    fn best_template_wins_for_action_type() {
        let mut weak = template("rebuild_index", TemplateOrigin::Static);
        weak.success_rate = 0.2;
        let mut strong = template("rebuild_index", TemplateOrigin::Learned);
        strong.success_rate = 0.9;
        let lib = TemplateLibrary::with_templates(vec![weak, strong.clone()]);
        assert_eq!(lib.find_by_action_type("rebuild_index").unwrap().id, strong.id);
    }
}
