//! arbiter-engine: the autonomous decision loop.
//!
//! Raw events are classified into observations and queued by urgency. The
//! loop batches them, builds a context, walks a five-stage reasoning chain
//! against an external oracle, calibrates the resulting confidence against
//! history, gates actions through safety checks, dispatches them to executor
//! backends, and learns from the outcome. Every decision is recorded in
//! `arbiter-history` before it runs.

pub mod action;
pub mod batch;
pub mod calibration;
pub mod classifier;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod learner;
pub mod oracle;
pub mod parse;
pub mod prompts;
pub mod queue;
pub mod reasoner;
pub mod resources;
pub mod safety;
pub mod similarity;
pub mod templates;
pub mod tracker;

pub use config::ConfigHandle;
pub use engine::{CycleReport, Engine, Shutdown};
pub use error::{EngineError, Result};
pub use executor::{Executor, ExecutorRegistry};
pub use ingest::Ingestor;
pub use oracle::{Oracle, OracleError};
