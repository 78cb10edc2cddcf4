//! Reasoning oracle clients.
//!
//! The oracle is a stateless text-completion service: prompt in, text out.
//! Two transports are provided: a local command fed on stdin, and an HTTP
//! endpoint.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use arbiter_core::config::OracleConfig;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("No oracle configured: set engine.oracle.command or engine.oracle.endpoint")]
    NotConfigured,

    #[error("Failed to spawn oracle command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Oracle exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("Oracle timed out after {0}s")]
    Timeout(u64),

    #[error("Oracle HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError>;
}

/// Build the oracle described by the config. `command` wins over `endpoint`.
pub fn from_config(config: &OracleConfig) -> Result<Arc<dyn Oracle>, OracleError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    if let Some((program, args)) = config.command.split_first() {
        return Ok(Arc::new(CommandOracle::new(program, args, timeout)));
    }
    if let Some(endpoint) = &config.endpoint {
        return Ok(Arc::new(HttpOracle::new(endpoint, timeout)?));
    }
    Err(OracleError::NotConfigured)
}

// ── Command transport ─────────────────────────────────────────────

/// Spawns a command per prompt: prompt on stdin, completion on stdout.
pub struct CommandOracle {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandOracle {
    pub fn new(program: &str, args: &[String], timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            timeout,
        }
    }
}

#[async_trait]
impl Oracle for CommandOracle {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OracleError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Written from its own task so a large prompt cannot deadlock against
        // a full stdout pipe. Dropping stdin closes the pipe (EOF).
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_owned();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::debug!(error = %e, "Oracle closed stdin early");
                }
            });
        }

        // Timing out drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OracleError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            return Err(OracleError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

// ── HTTP transport ────────────────────────────────────────────────

/// POSTs `{"prompt": ...}`; accepts `{"completion": ...}` or a raw text body.
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOracle {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        Ok(completion_from_body(body))
    }
}

fn completion_from_body(body: String) -> String {
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Object(map)) => match map.get("completion") {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => body,
        },
        _ => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_field_is_unwrapped() {
        assert_eq!(
            completion_from_body(r#"{"completion": "{\"a\":1}"}"#.to_string()),
            r#"{"a":1}"#
        );
        assert_eq!(completion_from_body("plain text".to_string()), "plain text");
        // An object without `completion` is the completion itself.
        assert_eq!(completion_from_body(r#"{"a":1}"#.to_string()), r#"{"a":1}"#);
    }

    #[test]
    fn empty_config_is_not_configured() {
        assert!(matches!(
            from_config(&OracleConfig::default()),
            Err(OracleError::NotConfigured)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_oracle_echoes_stdin() {
        let oracle = CommandOracle::new("cat", &[], Duration::from_secs(5));
        let out = oracle.complete(r#"{"summary":"hi"}"#).await.unwrap();
        assert_eq!(out, r#"{"summary":"hi"}"#);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_oracle_times_out() {
        let oracle = CommandOracle::new(
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );
        assert!(matches!(
            oracle.complete("x").await,
            Err(OracleError::Timeout(_))
        ));
    }
}
