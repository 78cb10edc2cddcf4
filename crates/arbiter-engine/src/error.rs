//! Error types for the arbiter-engine crate.

use thiserror::Error;

use arbiter_core::ArbiterError;
use arbiter_history::StoreError;

use crate::oracle::OracleError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("History error: {0}")]
    History(#[from] StoreError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Config error: {0}")]
    Config(#[from] ArbiterError),

    #[error("Invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Task tracker error: {0}")]
    Tracker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Compile a list of regexes, reporting the first bad pattern.
pub(crate) fn compile_patterns(patterns: &[String]) -> Result<Vec<regex::Regex>> {
    patterns
        .iter()
        .map(|p| {
            regex::Regex::new(p).map_err(|source| EngineError::InvalidPattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}
