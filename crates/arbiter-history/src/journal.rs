//! Append-only JSON-lines journal.
//!
//! Backs the lessons log and the novel-action log. Lines that fail to parse
//! on read are skipped with a warning.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::StoreError;

pub struct Journal<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _entry: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _entry: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single line.
    pub fn append(&self, entry: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Every readable entry, oldest first. A missing file is an empty journal.
    pub fn read_all(&self) -> Result<Vec<T>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping malformed journal line"
                    );
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Lesson, LessonKind};
    use arbiter_core::{DecisionId, PatternKey};
    use chrono::Utc;

    fn lesson(kind: LessonKind) -> Lesson {
        Lesson {
            timestamp: Utc::now(),
            decision_id: DecisionId::new(),
            pattern_key: PatternKey("intake:file_created:ACT:triage".to_string()),
            kind,
            confidence: 0.9,
            text: "High-confidence triage failed".to_string(),
        }
    }

    #[test]
    fn append_then_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal: Journal<Lesson> = Journal::new(dir.path().join("lessons.jsonl"));

        let first = lesson(LessonKind::OverconfidentFailure);
        let second = lesson(LessonKind::UnderconfidentSuccess);
        journal.append(&first).unwrap();
        journal.append(&second).unwrap();

        assert_eq!(journal.read_all().unwrap(), vec![first, second]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lessons.jsonl");
        let journal: Journal<Lesson> = Journal::new(&path);
        journal.append(&lesson(LessonKind::OverconfidentFailure)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        assert_eq!(journal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal: Journal<Lesson> = Journal::new(dir.path().join("none.jsonl"));
        assert!(journal.read_all().unwrap().is_empty());
    }
}
