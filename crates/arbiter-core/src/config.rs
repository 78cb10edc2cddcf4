//! Configuration for the Arbiter decision engine.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`ARBITER__ENGINE__...`, `__` separated)
//! 2. Config file (`arbiter.toml`, `[engine]` section)
//! 3. Defaults
//!
//! Every field has a serde default so partial files are valid.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decision::ExecutorKind;
use crate::error::ArbiterError;
use crate::types::{Category, Urgency};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub reasoner: ReasonerConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub executors: ExecutorConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

impl EngineConfig {
    /// Load the `[engine]` section from `{file_prefix}.*` plus environment
    /// overrides. A missing section yields the defaults; a malformed one is
    /// logged and also yields the defaults.
    pub fn load(file_prefix: &str) -> Self {
        match Self::try_load(file_prefix) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid engine configuration, using defaults");
                EngineConfig::default()
            }
        }
    }

    /// Like [`EngineConfig::load`], but a section that exists and fails to
    /// parse is an error. Used by hot reload to keep the previous config.
    pub fn try_load(file_prefix: &str) -> Result<Self, ArbiterError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("ARBITER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ArbiterError::Config(e.to_string()))?;

        match cfg.get::<EngineConfig>("engine") {
            Ok(c) => Ok(c),
            Err(config::ConfigError::NotFound(_)) => Ok(EngineConfig::default()),
            Err(e) => Err(ArbiterError::Config(e.to_string())),
        }
    }

    /// Load the `[engine]` section from one explicit file, without
    /// environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ArbiterError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ArbiterError::Config(e.to_string()))?;

        match cfg.get::<EngineConfig>("engine") {
            Ok(c) => Ok(c),
            Err(config::ConfigError::NotFound(_)) => Ok(EngineConfig::default()),
            Err(e) => Err(ArbiterError::Config(e.to_string())),
        }
    }
}

// ── Classifier ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    /// Observation type name → urgency, consulted before the built-in table.
    #[serde(default)]
    pub urgency_overrides: HashMap<String, Urgency>,

    /// Regexes over the path; any match forces NOISE urgency.
    #[serde(default = "default_noise_patterns")]
    pub noise_patterns: Vec<String>,

    /// Ordered path rules; first match wins.
    #[serde(default = "default_category_rules")]
    pub category_rules: Vec<CategoryRule>,

    /// Extensions (without dot) that make an unmatched path KNOWLEDGE.
    #[serde(default = "default_document_extensions")]
    pub document_extensions: Vec<String>,
}

/// Maps paths matching `pattern` (a regex) to `category`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryRule {
    pub pattern: String,
    pub category: Category,
}

fn default_noise_patterns() -> Vec<String> {
    [
        r"(^|/)\.git/",
        r"(^|/)\.(svn|hg)/",
        r"\.(tmp|temp|swp|swo|swx|lock|pyc)$",
        r"~$",
        r"(^|/)\.#",
        r"(^|/)\.DS_Store$",
        r"(^|/)__pycache__/",
        r"(^|/)node_modules/",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_category_rules() -> Vec<CategoryRule> {
    let rule = |pattern: &str, category| CategoryRule {
        pattern: pattern.to_string(),
        category,
    };
    vec![
        rule(r"^(\./)?(arbiter-data|\.arbiter)/", Category::SelfReferential),
        rule(r"^(\./)?(inbox|intake|staging)/", Category::Intake),
        rule(r"(^|/)(INDEX|index|_index)\.(md|json|txt)$", Category::Index),
        rule(r"^(\./)?(lessons|feedback)/", Category::LearningSignal),
        rule(
            r"(^|/)(config|\.config)/|\.(toml|ya?ml|ini|conf)$",
            Category::Configuration,
        ),
        rule(r"^(\./)?(knowledge|kb|notes|docs)/", Category::Knowledge),
    ]
}

fn default_document_extensions() -> Vec<String> {
    ["md", "markdown", "txt", "rst", "org", "adoc", "pdf", "html"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            urgency_overrides: HashMap::new(),
            noise_patterns: default_noise_patterns(),
            category_rules: default_category_rules(),
            document_extensions: default_document_extensions(),
        }
    }
}

// ── Thresholds ────────────────────────────────────────────────────

/// Confidence thresholds used by the final reasoning stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    #[serde(default = "default_act")]
    pub act: f64,
    /// ACT threshold when the observe stage flags significance "critical".
    #[serde(default = "default_act_critical")]
    pub act_critical: f64,
    #[serde(default = "default_investigate")]
    pub investigate: f64,
    #[serde(default = "default_wait")]
    pub wait: f64,
}

fn default_act() -> f64 {
    0.70
}

fn default_act_critical() -> f64 {
    0.85
}

fn default_investigate() -> f64 {
    0.50
}

fn default_wait() -> f64 {
    0.30
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            act: default_act(),
            act_critical: default_act_critical(),
            investigate: default_investigate(),
            wait: default_wait(),
        }
    }
}

// ── Batching ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Observations within this many milliseconds of the batch head group.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long a non-critical head waits for rapid-fire siblings to arrive.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_window_ms() -> u64 {
    2000
}

fn default_max_batch_size() -> usize {
    10
}

fn default_settle_ms() -> u64 {
    250
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_batch_size: default_max_batch_size(),
            settle_ms: default_settle_ms(),
        }
    }
}

// ── Context ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    /// How many similar observations and past decisions to include.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_template_top_k")]
    pub template_top_k: usize,
    #[serde(default = "default_max_related")]
    pub max_related: usize,
    /// Known index files, relative to the working directory.
    #[serde(default = "default_index_files")]
    pub index_files: Vec<String>,
}

fn default_max_file_bytes() -> usize {
    5 * 1024
}

fn default_history_window() -> usize {
    5
}

fn default_template_top_k() -> usize {
    3
}

fn default_max_related() -> usize {
    20
}

fn default_index_files() -> Vec<String> {
    vec!["INDEX.md".to_string(), "index.json".to_string()]
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            history_window: default_history_window(),
            template_top_k: default_template_top_k(),
            max_related: default_max_related(),
            index_files: default_index_files(),
        }
    }
}

// ── Reasoner ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasonerConfig {
    /// Re-prompts per stage after a schema failure.
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: u32,
    /// Timeout applied to WAIT decisions that do not specify one.
    #[serde(default = "default_wait_timeout")]
    pub default_wait_timeout_secs: u64,
    #[serde(default = "default_escalation_priority")]
    pub default_escalation_priority: u8,
}

fn default_max_parse_retries() -> u32 {
    1
}

fn default_wait_timeout() -> u64 {
    600
}

fn default_escalation_priority() -> u8 {
    25
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            max_parse_retries: default_max_parse_retries(),
            default_wait_timeout_secs: default_wait_timeout(),
            default_escalation_priority: default_escalation_priority(),
        }
    }
}

// ── Safety ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyConfig {
    /// Regexes over the serialized action; any match is an unconditional reject.
    #[serde(default = "default_forbidden_patterns")]
    pub forbidden_patterns: Vec<String>,
    /// Path prefixes an action may only touch with an approved confirmation.
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
    #[serde(default)]
    pub restrict_network: bool,
    /// Regexes that count as network access when `restrict_network` is set.
    #[serde(default = "default_network_patterns")]
    pub network_patterns: Vec<String>,
    /// Tokens removed by the single sanitization pass.
    #[serde(default = "default_strip_flags")]
    pub strip_flags: Vec<String>,
}

fn default_forbidden_patterns() -> Vec<String> {
    [
        r#"\brm\s+(-\S+\s+)*['"]?/[*'"]?([;&|)'"\s]|$)"#,
        r"--no-preserve-root",
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        r"\bmkfs(\.\w+)?\b",
        r"\bdd\s+[^\n]*of=/dev/(sd|hd|vd|nvme|disk|mmcblk)",
        r">\s*/dev/(sd|hd|vd|nvme|disk|mmcblk)",
        r#"\bchmod\s+(-\S+\s+)*777\s+['"]?/[*'"]?([;&|)'"\s]|$)"#,
        r"\bgit\s+push\s+(\S+\s+)*--force\b",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_protected_paths() -> Vec<String> {
    ["/etc/", "/usr/", "/bin/", "/boot/", ".git/", "~/.ssh/"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_network_patterns() -> Vec<String> {
    [r"\b(curl|wget|ssh|scp|rsync|nc|netcat|telnet)\b", r"https?://"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_strip_flags() -> Vec<String> {
    vec!["--force".to_string(), "--no-preserve-root".to_string()]
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            forbidden_patterns: default_forbidden_patterns(),
            protected_paths: default_protected_paths(),
            restrict_network: false,
            network_patterns: default_network_patterns(),
            strip_flags: default_strip_flags(),
        }
    }
}

// ── Executors ─────────────────────────────────────────────────────

/// Concurrency slots per executor backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorLimits {
    #[serde(default = "default_script_slots")]
    pub script: usize,
    #[serde(default = "default_task_slots")]
    pub task: usize,
    #[serde(default = "default_swarm_slots")]
    pub swarm: usize,
    #[serde(default = "default_internal_slots")]
    pub internal: usize,
    #[serde(default = "default_http_slots")]
    pub http: usize,
}

impl ExecutorLimits {
    pub fn get(&self, kind: ExecutorKind) -> usize {
        match kind {
            ExecutorKind::Script => self.script,
            ExecutorKind::Task => self.task,
            ExecutorKind::Swarm => self.swarm,
            ExecutorKind::Internal => self.internal,
            ExecutorKind::Http => self.http,
            ExecutorKind::Custom => 0,
        }
    }
}

fn default_script_slots() -> usize {
    2
}

fn default_task_slots() -> usize {
    2
}

fn default_swarm_slots() -> usize {
    1
}

fn default_internal_slots() -> usize {
    8
}

fn default_http_slots() -> usize {
    4
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            script: default_script_slots(),
            task: default_task_slots(),
            swarm: default_swarm_slots(),
            internal: default_internal_slots(),
            http: default_http_slots(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub limits: ExecutorLimits,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,
    #[serde(default = "default_cost_budget")]
    pub cost_budget: f64,
    /// WAIT timeout used when an ACT is deferred for lack of resources.
    #[serde(default = "default_defer_timeout")]
    pub defer_timeout_secs: u64,
    /// Upper bound on steps in a decomposed novel action.
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Command (program followed by args) for the single-task delegate.
    #[serde(default)]
    pub task_command: Vec<String>,
    /// Command (program followed by args) for the multi-agent delegate.
    #[serde(default)]
    pub swarm_command: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    1
}

fn default_memory_budget_mb() -> u64 {
    4096
}

fn default_cost_budget() -> f64 {
    100.0
}

fn default_defer_timeout() -> u64 {
    30
}

fn default_max_plan_steps() -> usize {
    8
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            limits: ExecutorLimits::default(),
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            memory_budget_mb: default_memory_budget_mb(),
            cost_budget: default_cost_budget(),
            defer_timeout_secs: default_defer_timeout(),
            max_plan_steps: default_max_plan_steps(),
            shell: default_shell(),
            task_command: Vec::new(),
            swarm_command: Vec::new(),
        }
    }
}

// ── Calibration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationConfig {
    /// Hard ceiling on any calibrated confidence.
    #[serde(default = "default_max_confidence")]
    pub max_confidence: f64,
    /// Limit the history weight approaches as samples grow.
    #[serde(default = "default_max_history_weight")]
    pub max_history_weight: f64,
    /// Sample count at which history gets half of `max_history_weight`.
    #[serde(default = "default_half_weight_samples")]
    pub half_weight_samples: f64,
    /// A failure at or above this confidence produces a lesson.
    #[serde(default = "default_overconfident")]
    pub overconfident_threshold: f64,
    /// A success at or below this confidence produces a lesson.
    #[serde(default = "default_underconfident")]
    pub underconfident_threshold: f64,
}

fn default_max_confidence() -> f64 {
    0.95
}

fn default_max_history_weight() -> f64 {
    0.5
}

fn default_half_weight_samples() -> f64 {
    10.0
}

fn default_overconfident() -> f64 {
    0.8
}

fn default_underconfident() -> f64 {
    0.4
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            max_confidence: default_max_confidence(),
            max_history_weight: default_max_history_weight(),
            half_weight_samples: default_half_weight_samples(),
            overconfident_threshold: default_overconfident(),
            underconfident_threshold: default_underconfident(),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root for decisions, statistics, outbox, journals and templates.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Attempts at a cycle when the history store fails to record.
    #[serde(default = "default_history_retries")]
    pub history_retries: u32,
}

fn default_data_dir() -> String {
    "./arbiter-data".to_string()
}

fn default_history_retries() -> u32 {
    3
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            history_retries: default_history_retries(),
        }
    }
}

// ── Oracle ────────────────────────────────────────────────────────

/// How to reach the reasoning oracle. `command` wins over `endpoint`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleConfig {
    /// Program followed by args; receives the prompt on stdin.
    #[serde(default)]
    pub command: Vec<String>,
    /// HTTP endpoint accepting `{"prompt": ...}`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
}

fn default_oracle_timeout() -> u64 {
    120
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            endpoint: None,
            timeout_secs: default_oracle_timeout(),
        }
    }
}
