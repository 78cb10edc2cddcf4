use thiserror::Error;

/// Top-level error type shared across Arbiter crates.
#[derive(Error, Debug)]
pub enum ArbiterError {
    #[error("Configuration error: {0}")]
    Config(String),
}
