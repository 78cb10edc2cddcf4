//! Hot-reloadable configuration handle.
//!
//! The decision loop asks for a reload between cycles, never mid-cycle. A
//! file that fails to parse keeps the previous configuration.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use arbiter_core::EngineConfig;

const EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

pub struct ConfigHandle {
    prefix: Option<String>,
    path: Option<PathBuf>,
    modified: Option<SystemTime>,
    current: EngineConfig,
}

impl ConfigHandle {
    /// Load `{prefix}.*` plus environment overrides, and watch that file.
    pub fn open(prefix: &str) -> Self {
        let current = EngineConfig::load(prefix);
        let path = resolve(prefix);
        let modified = path.as_deref().and_then(mtime);
        if let Some(p) = &path {
            tracing::info!(path = %p.display(), "Configuration loaded");
        } else {
            tracing::info!(prefix = %prefix, "No configuration file, using defaults and environment");
        }
        Self {
            prefix: Some(prefix.to_string()),
            path,
            modified,
            current,
        }
    }

    /// A configuration that never reloads.
    pub fn fixed(config: EngineConfig) -> Self {
        Self {
            prefix: None,
            path: None,
            modified: None,
            current: config,
        }
    }

    pub fn current(&self) -> &EngineConfig {
        &self.current
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the file if its modification time changed (or it appeared).
    /// Returns the new configuration when one was applied.
    pub fn reload_if_changed(&mut self) -> Option<&EngineConfig> {
        let prefix = self.prefix.as_deref()?;
        let path = self.path.clone().or_else(|| resolve(prefix))?;
        let modified = mtime(&path);
        if self.path.as_ref() == Some(&path) && modified == self.modified {
            return None;
        }
        self.path = Some(path.clone());
        self.modified = modified;

        match EngineConfig::try_load(prefix) {
            Ok(config) if config == self.current => None,
            Ok(config) => {
                tracing::info!(path = %path.display(), "Configuration reloaded");
                self.current = config;
                Some(&self.current)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Configuration reload failed, keeping previous configuration"
                );
                None
            }
        }
    }
}

fn resolve(prefix: &str) -> Option<PathBuf> {
    let exact = PathBuf::from(prefix);
    if exact.is_file() {
        return Some(exact);
    }
    EXTENSIONS
        .iter()
        .map(|ext| PathBuf::from(format!("{prefix}.{ext}")))
        .find(|p| p.is_file())
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
