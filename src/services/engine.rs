//! Supervision of the external clustering engine.
//!
//! The engine is invoked as `<program> <args...> <staged path>`. Standard output
//! carries the result document; standard error is reserved for failures.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::config::{AnalysisConfig, StderrPolicy};
use crate::services::staging::StagedFile;

/// Per-stream capture cap when none is configured
const DEFAULT_OUTPUT_LIMIT: u64 = 64 * 1024 * 1024;

/// One finished engine run
#[derive(Debug, Clone)]
pub struct AnalysisInvocation {
    pub pid: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to launch analysis engine '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Analysis engine timed out after {0:?}")]
    Timeout(Duration),

    #[error("Analysis engine failed (exit code {}): {stderr}", display_code(.exit_code))]
    Crashed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Analysis engine wrote more than {limit} bytes to {stream}")]
    OutputOverflow { stream: &'static str, limit: u64 },

    #[error("I/O error while supervising analysis engine: {0}")]
    Io(#[from] std::io::Error),
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none, killed by signal".to_string())
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Runs the engine against `staged`, killing it if it outlives `timeout`
    async fn invoke(
        &self,
        staged: &StagedFile,
        timeout: Duration,
    ) -> Result<AnalysisInvocation, EngineError>;

    /// Check if the engine can be started at all
    async fn health_check(&self) -> bool;
}

/// Runs the engine as a child process
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    stderr_policy: StderrPolicy,
    output_limit: u64,
}

impl ProcessEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            stderr_policy: StderrPolicy::Fail,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            program: config.engine_program.clone(),
            args: config.engine_args.clone(),
            working_dir: config.engine_working_dir.clone(),
            stderr_policy: config.stderr_policy,
            output_limit: config.engine_output_limit,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.stderr_policy = policy;
        self
    }

    pub fn with_output_limit(mut self, limit: u64) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, staged: &StagedFile) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&staged.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the child (timeout, cancelled request) kills the process
            .kill_on_drop(true);
        // Own process group, so helpers the engine forks can be killed with it
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Applies the completion policy to a finished run
    fn judge(&self, invocation: AnalysisInvocation) -> Result<AnalysisInvocation, EngineError> {
        let stderr = String::from_utf8_lossy(&invocation.stderr).trim().to_string();

        // Any byte counts, whitespace included
        if !invocation.stderr.is_empty() {
            match self.stderr_policy {
                StderrPolicy::Fail => {
                    let diagnostics = if stderr.is_empty() {
                        format!(
                            "engine wrote {} blank byte(s) to stderr",
                            invocation.stderr.len()
                        )
                    } else {
                        stderr
                    };
                    return Err(EngineError::Crashed {
                        exit_code: invocation.status.code(),
                        stderr: diagnostics,
                    });
                }
                StderrPolicy::Warn => {
                    tracing::warn!(pid = ?invocation.pid, "Analysis engine stderr: {}", stderr);
                }
            }
        }

        if !invocation.status.success() {
            let diagnostics = if stderr.is_empty() {
                reported_error(&invocation.stdout)
                    .unwrap_or_else(|| "engine exited without diagnostics".to_string())
            } else {
                stderr
            };
            return Err(EngineError::Crashed {
                exit_code: invocation.status.code(),
                stderr: diagnostics,
            });
        }

        Ok(invocation)
    }
}

#[async_trait]
impl AnalysisEngine for ProcessEngine {
    async fn invoke(
        &self,
        staged: &StagedFile,
        timeout: Duration,
    ) -> Result<AnalysisInvocation, EngineError> {
        let started = Instant::now();
        let mut child = self.command(staged).spawn().map_err(|source| EngineError::Launch {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();
        let mut group = ProcessGroupGuard::new(pid);

        tracing::debug!(pid = ?pid, staged_id = %staged.id, "Analysis engine started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("engine stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("engine stderr not captured"))?;

        let limit = self.output_limit;
        // Both streams drain concurrently, so a chatty engine can never block
        // on a full pipe. The first stream over the cap ends the run.
        let run = async {
            let (stdout, stderr) = tokio::try_join!(
                drain(stdout, limit, "stdout"),
                drain(stderr, limit, "stderr")
            )?;
            let status = child.wait().await?;
            Ok::<_, EngineError>((status, stdout, stderr))
        };

        let outcome = tokio::time::timeout(timeout, run).await;

        let (status, stdout, stderr) = match outcome {
            Ok(Ok(finished)) => finished,
            Ok(Err(e)) => {
                tracing::warn!(pid = ?pid, "Analysis engine aborted: {}", e);
                group.kill();
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(pid = ?pid, "Analysis engine exceeded {:?}, killing it", timeout);
                group.kill();
                if let Err(e) = child.kill().await {
                    tracing::error!(pid = ?pid, "Failed to kill analysis engine: {}", e);
                }
                return Err(EngineError::Timeout(timeout));
            }
        };
        group.disarm();

        let invocation = AnalysisInvocation {
            pid,
            stdout,
            stderr,
            status,
            elapsed: started.elapsed(),
        };

        tracing::debug!(
            pid = ?pid,
            exit_code = ?invocation.status.code(),
            stdout_bytes = invocation.stdout.len(),
            stderr_bytes = invocation.stderr.len(),
            elapsed_ms = %invocation.elapsed.as_millis(),
            "Analysis engine finished"
        );

        self.judge(invocation)
    }

    async fn health_check(&self) -> bool {
        let probe = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        matches!(
            tokio::time::timeout(Duration::from_secs(5), probe).await,
            Ok(Ok(_))
        )
    }
}

async fn drain(
    stream: impl AsyncRead + Unpin,
    limit: u64,
    name: &'static str,
) -> Result<Vec<u8>, EngineError> {
    let mut buf = Vec::new();
    stream
        .take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .await?;
    if buf.len() as u64 > limit {
        return Err(EngineError::OutputOverflow {
            stream: name,
            limit,
        });
    }
    Ok(buf)
}

/// Kills the engine's process group when dropped armed. `kill_on_drop` only
/// reaches the direct child.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        // pgid 0 would name our own group
        Self {
            pgid: pid.filter(|&p| p != 0 && p <= i32::MAX as u32),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let result = std::process::Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pgid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        tracing::warn!(pgid, "Failed to signal engine process group: {}", e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(pgid: u32) {
    let _ = pgid;
}

/// The reference engine prints `{"error": "..."}` to stdout when it cannot read
/// the dataset and exits non-zero without touching stderr.
#[derive(Deserialize)]
struct EngineReportedError {
    error: String,
}

fn reported_error(stdout: &[u8]) -> Option<String> {
    serde_json::from_slice::<EngineReportedError>(stdout)
        .ok()
        .map(|e| e.error)
}
