//! arbiter-core: Shared types, configuration, and error handling for the
//! Arbiter decision engine.
//!
//! This crate provides the foundational types used across all Arbiter crates:
//! - Observations and their classification enums
//! - Decisions, reasoning steps, outcomes and pattern statistics
//! - Action templates
//! - Raw events at the ingestion boundary
//! - The `EngineConfig` configuration surface
//! - Common error types

pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod template;
pub mod types;

pub use config::EngineConfig;
pub use decision::{
    ActionSpec, Decision, DecisionPayload, DecisionType, ExecutorKind, Outcome, OutcomeKind,
    PatternKey, PatternStats, ReasoningStage, ReasoningStep,
};
pub use error::ArbiterError;
pub use events::RawEvent;
pub use template::{ActionTemplate, PlanStep, TemplateId, TemplateOrigin};
pub use types::{Category, DecisionId, Observation, ObservationId, ObservationType, Urgency};
