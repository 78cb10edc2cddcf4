//! Executor backends.
//!
//! Every backend exposes the same `execute(step, timeout)` contract; only
//! this module knows how each one is invoked. Scripts and delegates run as
//! child processes via `tokio::process::Command` and are killed when their
//! timeout elapses.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use arbiter_core::config::ExecutorConfig;
use arbiter_core::{ExecutorKind, PlanStep};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Ran and failed; worth retrying.
    #[error("Step failed: {0}")]
    Failed(String),

    /// Cannot succeed as specified (bad details, missing capability).
    #[error("Step cannot run: {0}")]
    Permanent(String),

    #[error("No executor registered for `{0}`")]
    Unavailable(ExecutorKind),

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutorError {
    /// Transient failures are retried per the template's retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Failed(_))
    }
}

/// What a successful step produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub output: String,
    pub duration: Duration,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    async fn execute(&self, step: &PlanStep, timeout: Duration)
        -> Result<StepOutput, ExecutorError>;
}

/// Executors keyed by the backend they serve.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard backends. Task and swarm delegates are only registered
    /// when a delegate command is configured.
    pub fn from_config(config: &ExecutorConfig) -> Self {
        let mut registry = Self::new()
            .with(Arc::new(ScriptExecutor::new(&config.shell)))
            .with(Arc::new(NoopExecutor))
            .with(Arc::new(HttpExecutor::new()));
        if let Some(delegate) = DelegateExecutor::new(ExecutorKind::Task, &config.task_command) {
            registry = registry.with(Arc::new(delegate));
        }
        if let Some(delegate) = DelegateExecutor::new(ExecutorKind::Swarm, &config.swarm_command) {
            registry = registry.with(Arc::new(delegate));
        }
        registry
    }

    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(executor.kind(), executor);
        self
    }

    pub fn get(&self, kind: ExecutorKind) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn supports(&self, kind: ExecutorKind) -> bool {
        self.executors.contains_key(&kind)
    }
}

// ── Script ────────────────────────────────────────────────────────

/// Runs `details.command` (or `details.script`) with `{shell} -c`.
/// Optional `details.cwd` and `details.env` (string map).
pub struct ScriptExecutor {
    shell: String,
}

impl ScriptExecutor {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
        }
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Script
    }

    async fn execute(
        &self,
        step: &PlanStep,
        timeout: Duration,
    ) -> Result<StepOutput, ExecutorError> {
        let script = ["command", "script"]
            .iter()
            .find_map(|k| step.details.get(*k).and_then(Value::as_str))
            .ok_or_else(|| ExecutorError::Permanent("script step has no `command`".to_string()))?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(script);
        if let Some(cwd) = step.details.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = step.details.get("env").and_then(Value::as_object) {
            for (k, v) in env {
                if let Some(v) = v.as_str() {
                    cmd.env(k, v);
                }
            }
        }

        tracing::debug!(shell = %self.shell, script = %script, "Running script step");
        run_child(cmd, &self.shell, None, timeout).await
    }
}

// ── Delegates ─────────────────────────────────────────────────────

/// Hands a step to an external agent runner: the configured command gets the
/// step as JSON on stdin and reports on stdout.
pub struct DelegateExecutor {
    kind: ExecutorKind,
    program: String,
    args: Vec<String>,
}

impl DelegateExecutor {
    pub fn new(kind: ExecutorKind, command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            kind,
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Executor for DelegateExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(
        &self,
        step: &PlanStep,
        timeout: Duration,
    ) -> Result<StepOutput, ExecutorError> {
        let input = serde_json::to_string(step)
            .map_err(|e| ExecutorError::Permanent(format!("step not serializable: {e}")))?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        tracing::debug!(kind = %self.kind, program = %self.program, "Delegating step");
        run_child(cmd, &self.program, Some(input), timeout).await
    }
}

/// Spawn, optionally feed stdin, wait with a timeout. The child is killed
/// if the timeout elapses.
async fn run_child(
    mut cmd: Command,
    program: &str,
    stdin: Option<String>,
    timeout: Duration,
) -> Result<StepOutput, ExecutorError> {
    let start = Instant::now();
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                tracing::debug!(error = %e, "Executor closed stdin early");
            }
        });
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(ExecutorError::Failed(e.to_string())),
        Err(_) => {
            tracing::warn!(program = %program, timeout_secs = timeout.as_secs(), "Step timed out, killed");
            return Err(ExecutorError::Timeout(timeout));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExecutorError::Failed(format!(
            "exit code {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }

    Ok(StepOutput {
        output: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        duration: start.elapsed(),
    })
}

// ── HTTP ──────────────────────────────────────────────────────────

/// `details.url` (required), `details.method` (default POST),
/// `details.body` (JSON) and `details.headers` (string map).
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Http
    }

    async fn execute(
        &self,
        step: &PlanStep,
        timeout: Duration,
    ) -> Result<StepOutput, ExecutorError> {
        let start = Instant::now();
        let url = step
            .details
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::Permanent("http step has no `url`".to_string()))?;
        let method = step
            .details
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST");
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ExecutorError::Permanent(format!("invalid HTTP method `{method}`")))?;

        let mut request = self.client.request(method, url).timeout(timeout);
        if let Some(headers) = step.details.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    request = request.header(k.as_str(), v);
                }
            }
        }
        if let Some(body) = step.details.get("body") {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout(timeout)
            } else if e.is_builder() {
                ExecutorError::Permanent(e.to_string())
            } else {
                ExecutorError::Failed(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutorError::Failed(e.to_string()))?;
        if status.is_client_error() {
            return Err(ExecutorError::Permanent(format!("HTTP {status}: {text}")));
        }
        if !status.is_success() {
            return Err(ExecutorError::Failed(format!("HTTP {status}: {text}")));
        }
        Ok(StepOutput {
            output: text,
            duration: start.elapsed(),
        })
    }
}

// ── Internal ──────────────────────────────────────────────────────

/// Internal bookkeeping actions: nothing to run, always succeeds.
pub struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Internal
    }

    async fn execute(
        &self,
        step: &PlanStep,
        _timeout: Duration,
    ) -> Result<StepOutput, ExecutorError> {
        Ok(StepOutput {
            output: format!("noop: {}", step.description),
            duration: Duration::ZERO,
        })
    }
}
