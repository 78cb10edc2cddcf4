//! Read-only view of external task and goal state.
//!
//! Active tasks and goals are owned by an outside tracker; the engine only
//! queries them while building context.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Snapshot of the tracker at context-building time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrackerState {
    #[serde(default)]
    pub tasks: Vec<Value>,
    #[serde(default)]
    pub goals: Vec<Value>,
}

#[async_trait]
pub trait TaskTracker: Send + Sync {
    async fn snapshot(&self) -> Result<TrackerState>;
}

/// No tracker configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTracker;

#[async_trait]
impl TaskTracker for NullTracker {
    async fn snapshot(&self) -> Result<TrackerState> {
        Ok(TrackerState::default())
    }
}

const INACTIVE: [&str; 5] = ["done", "completed", "cancelled", "canceled", "archived"];

/// Reads `{"tasks": [...], "goals": [...]}` from a JSON file. A missing file
/// is an empty tracker; entries whose `status` is finished are dropped.
#[derive(Debug, Clone)]
pub struct JsonFileTracker {
    path: PathBuf,
}

impl JsonFileTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaskTracker for JsonFileTracker {
    async fn snapshot(&self) -> Result<TrackerState> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TrackerState::default())
            }
            Err(e) => return Err(e.into()),
        };
        let state: TrackerState = serde_json::from_str(&text).map_err(|e| {
            EngineError::Tracker(format!("{}: {e}", self.path.display()))
        })?;
        Ok(TrackerState {
            tasks: state.tasks.into_iter().filter(is_active).collect(),
            goals: state.goals.into_iter().filter(is_active).collect(),
        })
    }
}

fn is_active(entry: &Value) -> bool {
    match entry.get("status").and_then(Value::as_str) {
        Some(status) => !INACTIVE.contains(&status.trim().to_ascii_lowercase().as_str()),
        None => true,
    }
}
