//! Decision storage — trait + file-backed implementation.
//!
//! Decisions are stored as JSON files organized by date and decision ID.
//! The store is append-only: a decision is written once, then its outcome
//! is written once. Pattern statistics are updated in the same call that
//! persists the decision or outcome they derive from.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use arbiter_core::{
    Category, DecisionId, DecisionType, ObservationType, Outcome, PatternKey, PatternStats,
};

use crate::stats::{write_atomic, PatternTable};
use crate::DecisionRecord;

/// Errors that can occur during history storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Decision not found: {0}")]
    NotFound(DecisionId),

    #[error("Decision {0} already recorded; history is append-only")]
    AlreadyExists(DecisionId),

    #[error("Outcome for decision {0} already recorded")]
    OutcomeAlreadyRecorded(DecisionId),

    #[error("Integrity check failed for decision {0}: stored hash does not match content")]
    IntegrityViolation(DecisionId),

    #[error("Decision record has no content hash (not sealed)")]
    NotSealed,

    #[error("History lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Query parameters for listing decisions.
#[derive(Debug, Default, Clone)]
pub struct DecisionQuery {
    pub category: Option<Category>,
    pub observation_type: Option<ObservationType>,
    pub decision_type: Option<DecisionType>,
    /// Only include decisions recorded at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only include decisions recorded at or before this time.
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of results (newest first).
    pub limit: Option<usize>,
}

/// Trait for history persistence backends.
///
/// Implementations must tolerate concurrent callers: independent loop
/// instances share one store.
pub trait HistoryStore: Send + Sync {
    /// Persist a sealed record and fold it into its pattern statistics.
    /// Fails with `AlreadyExists` if the decision ID was recorded before.
    fn append(&self, record: &DecisionRecord) -> Result<(), StoreError>;

    /// Retrieve a record by decision ID, verifying integrity.
    fn get(&self, id: DecisionId) -> Result<DecisionRecord, StoreError>;

    /// List records matching the query, newest first.
    fn list(&self, query: &DecisionQuery) -> Result<Vec<DecisionRecord>, StoreError>;

    /// Write the outcome onto a recorded decision and fold it into the
    /// pattern statistics. Fails if an outcome was already recorded.
    fn record_outcome(
        &self,
        id: DecisionId,
        outcome: &Outcome,
    ) -> Result<DecisionRecord, StoreError>;

    fn pattern_stats(&self, key: &PatternKey) -> Result<Option<PatternStats>, StoreError>;

    fn all_pattern_stats(&self) -> Result<Vec<PatternStats>, StoreError>;
}

struct Entry {
    path: PathBuf,
    record: DecisionRecord,
}

/// File-system backed history store.
///
/// Layout:
/// ```text
/// {root}/
///   decisions/
///     2024/01/15/{decision_id}.json
///   patterns.json
/// ```
///
/// Records are also kept in memory for queries; `get` re-reads from disk so
/// tampering is caught.
pub struct FileHistoryStore {
    root: PathBuf,
    entries: RwLock<HashMap<DecisionId, Entry>>,
    patterns: Mutex<PatternTable>,
}

impl FileHistoryStore {
    /// Open a store rooted at the given directory, creating it if needed and
    /// loading existing records.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let decisions = root.join("decisions");
        fs::create_dir_all(&decisions)?;

        let mut entries = HashMap::new();
        collect_records_recursive(&decisions, &mut entries)?;
        let patterns = PatternTable::open(root.join("patterns.json"))?;

        tracing::debug!(
            root = %root.display(),
            decisions = entries.len(),
            "History store opened"
        );

        Ok(Self {
            root,
            entries: RwLock::new(entries),
            patterns: Mutex::new(patterns),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the file path for a record based on its decision date and ID.
    fn record_path(&self, record: &DecisionRecord) -> PathBuf {
        let date = record.decision.timestamp.format("%Y/%m/%d");
        self.root
            .join("decisions")
            .join(format!("{}/{}.json", date, record.decision.id.0))
    }
}

impl HistoryStore for FileHistoryStore {
    fn append(&self, record: &DecisionRecord) -> Result<(), StoreError> {
        if record.content_hash.is_none() {
            return Err(StoreError::NotSealed);
        }

        let id = record.decision.id;
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        if entries.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }

        let path = self.record_path(record);
        if path.exists() {
            return Err(StoreError::AlreadyExists(id));
        }
        let json = serde_json::to_string_pretty(record)?;
        write_atomic(&path, json.as_bytes())?;

        let stats = {
            let mut patterns = self.patterns.lock().map_err(|_| StoreError::LockPoisoned)?;
            patterns.record_decision(&record.pattern_key, record.decision.confidence)
        };
        if let Err(e) = stats {
            // The decision is not "made" unless both writes landed.
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        entries.insert(
            id,
            Entry {
                path: path.clone(),
                record: record.clone(),
            },
        );

        tracing::debug!(
            decision_id = %id,
            pattern = %record.pattern_key,
            path = %path.display(),
            "Decision recorded"
        );

        Ok(())
    }

    fn get(&self, id: DecisionId) -> Result<DecisionRecord, StoreError> {
        let path = {
            let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
            entries
                .get(&id)
                .map(|e| e.path.clone())
                .ok_or(StoreError::NotFound(id))?
        };

        let json = fs::read_to_string(&path)?;
        let record: DecisionRecord = serde_json::from_str(&json)?;

        if !record.verify_integrity() {
            return Err(StoreError::IntegrityViolation(id));
        }

        Ok(record)
    }

    fn list(&self, query: &DecisionQuery) -> Result<Vec<DecisionRecord>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut results: Vec<DecisionRecord> = entries
            .values()
            .map(|e| &e.record)
            .filter(|r| matches_query(r, query))
            .cloned()
            .collect();

        // Sort by decision timestamp descending
        results.sort_by(|a, b| b.decision.timestamp.cmp(&a.decision.timestamp));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    fn record_outcome(
        &self,
        id: DecisionId,
        outcome: &Outcome,
    ) -> Result<DecisionRecord, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        let entry = entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let mut updated = entry.record.clone();
        if !updated.decision.record_outcome(outcome) {
            return Err(StoreError::OutcomeAlreadyRecorded(id));
        }

        let previous = serde_json::to_string_pretty(&entry.record)?;
        let json = serde_json::to_string_pretty(&updated)?;
        write_atomic(&entry.path, json.as_bytes())?;

        let stats = {
            let mut patterns = self.patterns.lock().map_err(|_| StoreError::LockPoisoned)?;
            patterns.record_outcome(&updated.pattern_key, outcome.is_success())
        };
        if let Err(e) = stats {
            // The file and the table must agree; put the outcome-less record back.
            if let Err(restore) = write_atomic(&entry.path, previous.as_bytes()) {
                tracing::error!(decision_id = %id, error = %restore, "Could not roll back outcome");
            }
            return Err(e);
        }
        entry.record = updated.clone();

        tracing::debug!(
            decision_id = %id,
            outcome = ?outcome.kind,
            "Outcome recorded"
        );

        Ok(updated)
    }

    fn pattern_stats(&self, key: &PatternKey) -> Result<Option<PatternStats>, StoreError> {
        let patterns = self.patterns.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(patterns.get(key).cloned())
    }

    fn all_pattern_stats(&self) -> Result<Vec<PatternStats>, StoreError> {
        let patterns = self.patterns.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(patterns.all())
    }
}

/// Recursively load every record under `dir`.
fn collect_records_recursive(
    dir: &Path,
    entries: &mut HashMap<DecisionId, Entry>,
) -> Result<(), StoreError> {
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_records_recursive(&path, entries)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let json = fs::read_to_string(&path)?;
            match serde_json::from_str::<DecisionRecord>(&json) {
                Ok(record) => {
                    entries.insert(record.decision.id, Entry { path, record });
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable decision record");
                }
            }
        }
    }

    Ok(())
}

/// Check whether a record matches the given query filters.
fn matches_query(record: &DecisionRecord, query: &DecisionQuery) -> bool {
    if let Some(category) = &query.category {
        if &record.category != category {
            return false;
        }
    }
    if let Some(obs_type) = &query.observation_type {
        if &record.observation_type != obs_type {
            return false;
        }
    }
    if let Some(decision_type) = &query.decision_type {
        if &record.decision.decision_type() != decision_type {
            return false;
        }
    }
    if let Some(from) = &query.from {
        if &record.decision.timestamp < from {
            return false;
        }
    }
    if let Some(to) = &query.to {
        if &record.decision.timestamp > to {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::trace::tests::{sample_decision, sample_observation, sample_record};
    use arbiter_core::OutcomeKind;

    fn record_in(category: Category, confidence: f64) -> DecisionRecord {
        let observations = vec![sample_observation(category)];
        let decision = sample_decision(&observations, confidence);
        DecisionRecord::seal(decision, observations)
    }

    #[test]
    fn append_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::open(dir.path()).unwrap();
        let record = sample_record();
        let id = record.decision.id;

        store.append(&record).unwrap();
        let retrieved = store.get(id).unwrap();

        assert_eq!(retrieved.decision.id, id);
        assert_eq!(retrieved.decision.steps.len(), 1);
        assert_eq!(retrieved.observations.len(), 1);
        assert!(retrieved.verify_integrity());

        let stats = store.pattern_stats(&record.pattern_key).unwrap().unwrap();
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn append_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::open(dir.path()).unwrap();
        let record = sample_record();

        store.append(&record).unwrap();
        let again = store.append(&record);
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));

        let stats = store.pattern_stats(&record.pattern_key).unwrap().unwrap();
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn append_rejects_unsealed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::open(dir.path()).unwrap();
        let mut record = sample_record();
        record.content_hash = None;

        assert!(matches!(store.append(&record), Err(StoreError::NotSealed)));
    }

    #[test]
    fn integrity_violation_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::open(dir.path()).unwrap();
        let record = sample_record();
        let id = record.decision.id;
        store.append(&record).unwrap();

        // Tamper with the reasoning on disk.
        let path = store.record_path(&record);
        let mut tampered: DecisionRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        tampered.decision.reasoning = "TAMPERED".to_string();
        fs::write(&path, serde_json::to_string_pretty(&tampered).unwrap()).unwrap();

        let result = store.get(id);
        assert!(matches!(result, Err(StoreError::IntegrityViolation(_))));
    }

    #[test]
    fn outcome_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::open(dir.path()).unwrap();
        let record = sample_record();
        let id = record.decision.id;
        store.append(&record).unwrap();

        let updated = store
            .record_outcome(id, &Outcome::new(OutcomeKind::Success, "rebuilt", 1))
            .unwrap();
        assert_eq!(updated.decision.outcome_success, Some(true));
        assert!(store.get(id).unwrap().verify_integrity());

        let second = store.record_outcome(id, &Outcome::new(OutcomeKind::Failed, "no", 1));
        assert!(matches!(second, Err(StoreError::OutcomeAlreadyRecorded(_))));

        let stats = store.pattern_stats(&record.pattern_key).unwrap().unwrap();
        assert_eq!(stats.outcome_count, 1);
        assert_eq!(stats.success_rate(), Some(1.0));
    }

    #[test]
    fn outcome_rolls_back_when_stats_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::open(dir.path()).unwrap();
        let record = sample_record();
        let id = record.decision.id;
        store.append(&record).unwrap();

        // A directory in place of the table makes the rename fail.
        let table = dir.path().join("patterns.json");
        fs::remove_file(&table).unwrap();
        fs::create_dir_all(table.join("blocked")).unwrap();

        let outcome = Outcome::new(OutcomeKind::Success, "rebuilt", 1);
        assert!(store.record_outcome(id, &outcome).is_err());
        let on_disk = store.get(id).unwrap();
        assert_eq!(on_disk.decision.outcome_success, None);
        assert!(!on_disk.decision.executed);

        fs::remove_dir_all(&table).unwrap();
        let updated = store.record_outcome(id, &outcome).unwrap();
        assert_eq!(updated.decision.outcome_success, Some(true));
        let stats = store.pattern_stats(&record.pattern_key).unwrap().unwrap();
        assert_eq!(stats.outcome_count, 1);
    }

    #[test]
    fn list_filters_by_category_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::open(dir.path()).unwrap();

        for _ in 0..3 {
            store.append(&record_in(Category::Index, 0.8)).unwrap();
        }
        store.append(&record_in(Category::Intake, 0.6)).unwrap();

        let query = DecisionQuery {
            category: Some(Category::Index),
            limit: Some(2),
            ..Default::default()
        };
        let results = store.list(&query).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.category == Category::Index));
        assert!(results[0].decision.timestamp >= results[1].decision.timestamp);
    }

    #[test]
    fn reopen_loads_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample_record();
        {
            let store = FileHistoryStore::open(dir.path()).unwrap();
            store.append(&record).unwrap();
        }

        let store = FileHistoryStore::open(dir.path()).unwrap();
        assert_eq!(store.list(&DecisionQuery::default()).unwrap().len(), 1);
        assert!(store.get(record.decision.id).is_ok());
        assert_eq!(
            store.pattern_stats(&record.pattern_key).unwrap().unwrap().count,
            1
        );
    }

    #[test]
    fn concurrent_appends_are_all_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileHistoryStore::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        store.append(&record_in(Category::Knowledge, 0.7)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list(&DecisionQuery::default()).unwrap().len(), 40);
        let stats = store.all_pattern_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 40);
    }
}
