//! Pattern-statistics table.
//!
//! One JSON document keyed by pattern key, rewritten atomically (temp file
//! plus rename) on every change. Rows only accumulate.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use arbiter_core::{PatternKey, PatternStats};

use crate::store::StoreError;

pub struct PatternTable {
    path: PathBuf,
    rows: BTreeMap<PatternKey, PatternStats>,
}

impl PatternTable {
    /// Open the table at `path`, loading existing rows if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let rows = if path.exists() {
            let json = fs::read_to_string(&path)?;
            let list: Vec<PatternStats> = serde_json::from_str(&json)?;
            list.into_iter().map(|s| (s.key.clone(), s)).collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, rows })
    }

    pub fn get(&self, key: &PatternKey) -> Option<&PatternStats> {
        self.rows.get(key)
    }

    pub fn all(&self) -> Vec<PatternStats> {
        self.rows.values().cloned().collect()
    }

    /// Fold a decision's confidence into its row and persist.
    pub fn record_decision(
        &mut self,
        key: &PatternKey,
        confidence: f64,
    ) -> Result<PatternStats, StoreError> {
        self.update(key, |row| row.record_decision(confidence))
    }

    /// Fold a known outcome into its row and persist.
    pub fn record_outcome(
        &mut self,
        key: &PatternKey,
        success: bool,
    ) -> Result<PatternStats, StoreError> {
        self.update(key, |row| row.record_outcome(success))
    }

    /// Apply `f` to the row, persist, and roll back the in-memory row if the
    /// write fails.
    fn update(
        &mut self,
        key: &PatternKey,
        f: impl FnOnce(&mut PatternStats),
    ) -> Result<PatternStats, StoreError> {
        let previous = self.rows.get(key).cloned();
        let row = self
            .rows
            .entry(key.clone())
            .or_insert_with(|| PatternStats::new(key.clone()));
        f(row);
        let updated = row.clone();

        if let Err(e) = self.persist() {
            match previous {
                Some(prev) => {
                    self.rows.insert(key.clone(), prev);
                }
                None => {
                    self.rows.remove(key);
                }
            }
            return Err(e);
        }
        Ok(updated)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let list: Vec<&PatternStats> = self.rows.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// Write `bytes` to a sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        let key = PatternKey("index:file_modified:ACT:rebuild_index".to_string());

        let mut table = PatternTable::open(&path).unwrap();
        table.record_decision(&key, 0.8).unwrap();
        table.record_decision(&key, 0.6).unwrap();
        table.record_outcome(&key, true).unwrap();

        let reopened = PatternTable::open(&path).unwrap();
        let row = reopened.get(&key).unwrap();
        assert_eq!(row.count, 2);
        assert_eq!(row.outcome_count, 1);
        assert_eq!(row.success_count, 1);
        assert!((row.avg_confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn unknown_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let table = PatternTable::open(dir.path().join("patterns.json")).unwrap();
        assert!(table.get(&PatternKey("nope".to_string())).is_none());
        assert!(table.all().is_empty());
    }
}
