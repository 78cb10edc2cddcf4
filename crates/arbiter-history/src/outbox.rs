//! Escalation outbox: one human-readable Markdown file per escalated
//! decision, waiting for manual resolution.
//!
//! Layout:
//! ```text
//! {root}/
//!   pending/{timestamp}-p{priority}-{decision_id}.md
//!   resolved/{timestamp}-p{priority}-{decision_id}.md
//! ```
//!
//! Each file ends with an HTML comment holding the escalation as JSON so it
//! can be read back without parsing the prose.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use arbiter_core::{ActionSpec, DecisionId, ObservationId};

use crate::stats::write_atomic;
use crate::store::StoreError;

const MARKER: &str = "<!-- arbiter:escalation ";
const RESOLUTION_MARKER: &str = "<!-- arbiter:resolution ";

/// An escalated decision awaiting a human.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Escalation {
    pub decision_id: DecisionId,
    pub timestamp: DateTime<Utc>,
    /// 0 is most important.
    pub priority: u8,
    pub reason: String,
    pub observation_ids: Vec<ObservationId>,
    pub reasoning: String,
    pub confidence: f64,
    /// The action that was blocked, if the escalation came from a rejected ACT.
    pub action: Option<ActionSpec>,
}

/// How a human resolved an escalation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resolution {
    pub decision_id: DecisionId,
    pub approved: bool,
    pub resolved_at: DateTime<Utc>,
    pub note: Option<String>,
}

pub struct EscalationOutbox {
    root: PathBuf,
}

impl EscalationOutbox {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("pending"))?;
        fs::create_dir_all(root.join("resolved"))?;
        Ok(Self { root })
    }

    /// Write a pending escalation and return its file path.
    pub fn write(&self, escalation: &Escalation) -> Result<PathBuf, StoreError> {
        let name = format!(
            "{}-p{:03}-{}.md",
            escalation.timestamp.format("%Y%m%dT%H%M%S%.3fZ"),
            escalation.priority,
            escalation.decision_id.0
        );
        let path = self.root.join("pending").join(name);
        let body = render(escalation)?;
        write_atomic(&path, body.as_bytes())?;

        tracing::info!(
            decision_id = %escalation.decision_id,
            priority = escalation.priority,
            reason = %escalation.reason,
            "Escalation written to outbox"
        );
        Ok(path)
    }

    /// Remove a pending entry written by [`write`](Self::write) whose decision
    /// never made it into history.
    pub fn withdraw(&self, path: &Path) -> Result<(), StoreError> {
        if path.parent() != Some(self.root.join("pending").as_path()) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a pending escalation", path.display()),
            )));
        }
        fs::remove_file(path)?;
        tracing::debug!(path = %path.display(), "Escalation withdrawn");
        Ok(())
    }

    /// Pending escalations, most important first, then oldest first.
    pub fn list_pending(&self) -> Result<Vec<Escalation>, StoreError> {
        let mut pending: Vec<Escalation> = read_dir_md(&self.root.join("pending"))?
            .into_iter()
            .filter_map(|(path, text)| {
                let parsed = extract_json::<Escalation>(&text, MARKER);
                if parsed.is_none() {
                    tracing::warn!(path = %path.display(), "Unreadable outbox entry");
                }
                parsed
            })
            .collect();
        pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.timestamp.cmp(&b.timestamp))
        });
        Ok(pending)
    }

    /// Move a pending escalation to `resolved/`, appending the resolution.
    pub fn resolve(
        &self,
        decision_id: DecisionId,
        approved: bool,
        note: Option<String>,
    ) -> Result<Resolution, StoreError> {
        let id = decision_id.0.to_string();
        let pending = self.root.join("pending");
        let (path, text) = read_dir_md(&pending)?
            .into_iter()
            .find(|(path, _)| file_stem_ends_with(path, &id))
            .ok_or(StoreError::NotFound(decision_id))?;

        let resolution = Resolution {
            decision_id,
            approved,
            resolved_at: Utc::now(),
            note,
        };
        let verdict = if approved { "APPROVED" } else { "DECLINED" };
        let mut body = text;
        body.push_str(&format!(
            "\n## Resolution\n\n**{verdict}** at {}\n",
            resolution.resolved_at.to_rfc3339()
        ));
        if let Some(note) = &resolution.note {
            body.push_str(&format!("\n{note}\n"));
        }
        body.push_str(&format!(
            "\n{RESOLUTION_MARKER}{} -->\n",
            serde_json::to_string(&resolution)?
        ));

        let target = self.root.join("resolved").join(
            path.file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("{id}.md"))),
        );
        write_atomic(&target, body.as_bytes())?;
        fs::remove_file(&path)?;

        tracing::info!(decision_id = %decision_id, approved, "Escalation resolved");
        Ok(resolution)
    }

    /// Decision IDs of escalations resolved with approval.
    pub fn approved_ids(&self) -> Result<Vec<DecisionId>, StoreError> {
        Ok(read_dir_md(&self.root.join("resolved"))?
            .into_iter()
            .filter_map(|(_, text)| extract_json::<Resolution>(&text, RESOLUTION_MARKER))
            .filter(|r| r.approved)
            .map(|r| r.decision_id)
            .collect())
    }
}

fn render(e: &Escalation) -> Result<String, StoreError> {
    let mut out = format!("# Escalation: {}\n\n", e.reason);
    out.push_str(&format!("- **Decision:** `{}`\n", e.decision_id));
    out.push_str(&format!("- **Priority:** {}\n", e.priority));
    out.push_str(&format!("- **Raised:** {}\n", e.timestamp.to_rfc3339()));
    out.push_str(&format!("- **Confidence:** {:.2}\n", e.confidence));
    let ids: Vec<String> = e.observation_ids.iter().map(|id| format!("`{id}`")).collect();
    out.push_str(&format!("- **Observations:** {}\n", ids.join(", ")));

    out.push_str("\n## Reasoning\n\n");
    out.push_str(&e.reasoning);
    out.push('\n');

    if let Some(action) = &e.action {
        out.push_str("\n## Blocked action\n\n```json\n");
        out.push_str(&serde_json::to_string_pretty(action)?);
        out.push_str("\n```\n");
    }

    out.push_str(&format!(
        "\nResolve with `arbiter resolve {} --approve` or `arbiter resolve {}`.\n",
        e.decision_id, e.decision_id
    ));
    out.push_str(&format!("\n{MARKER}{} -->\n", serde_json::to_string(e)?));
    Ok(out)
}

fn extract_json<T: serde::de::DeserializeOwned>(text: &str, marker: &str) -> Option<T> {
    let start = text.rfind(marker)? + marker.len();
    let end = text[start..].find(" -->")? + start;
    serde_json::from_str(&text[start..end]).ok()
}

fn file_stem_ends_with(path: &Path, suffix: &str) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.ends_with(suffix))
        .unwrap_or(false)
}

fn read_dir_md(dir: &Path) -> Result<Vec<(PathBuf, String)>, StoreError> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("md") {
            let text = fs::read_to_string(&path)?;
            out.push((path, text));
        }
    }
    Ok(out)
}
