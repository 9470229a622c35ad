//! Tool Models
//!
//! The contract between the sandbox and analysis tools, and the
//! command-line implementation of it.

use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use veritas_core::{HealthStatus, ToolHealth, ToolScope, ToolSpec, UnitKind};

use crate::manager::executors::{ExecutorError, SubprocessExecutor};

/// Raw result of one tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Whether the tool considers the run successful
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Reasons a tool produced no exit status
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolRunError {
    #[error("Failed to start {program}: {detail}")]
    Spawn {
        kind: io::ErrorKind,
        program: String,
        detail: String,
    },

    #[error("Tool timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("Tool I/O failed: {0}")]
    Io(String),
}

impl From<ExecutorError> for ToolRunError {
    fn from(error: ExecutorError) -> Self {
        match error {
            ExecutorError::Spawn { program, source } => ToolRunError::Spawn {
                kind: source.kind(),
                program,
                detail: source.to_string(),
            },
            ExecutorError::TimedOut { timeout_ms, .. } => ToolRunError::TimedOut { timeout_ms },
            ExecutorError::Wait { source, .. } => ToolRunError::Io(source.to_string()),
        }
    }
}

/// An external analysis tool
#[async_trait]
pub trait AnalysisTool: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> UnitKind;

    fn scope(&self) -> ToolScope {
        ToolScope::PerFile
    }

    /// Whether the tool should run against `path` at all
    fn applies_to(&self, _path: &Path) -> bool {
        true
    }

    /// Lightweight availability check, run once per tool per run
    async fn probe(&self, timeout_ms: u64) -> ToolHealth;

    /// Run against `target` using `workspace` as scratch space
    async fn run(
        &self,
        target: &Path,
        workspace: &Path,
        timeout_ms: u64,
        max_output_bytes: usize,
    ) -> Result<ToolOutput, ToolRunError>;
}

/// One (tool, target) pair to execute
#[derive(Clone)]
pub struct AnalysisUnit {
    pub tool: Arc<dyn AnalysisTool>,
    pub target: PathBuf,
}

impl fmt::Debug for AnalysisUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisUnit")
            .field("tool", &self.tool.name())
            .field("target", &self.target)
            .finish()
    }
}

/// A tool driven through its command line
#[derive(Debug, Clone)]
pub struct CommandTool {
    spec: ToolSpec,
}

impl CommandTool {
    pub fn new(spec: ToolSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    /// Arguments with `{target}` and `{workspace}` substituted
    pub fn render_args(&self, target: &Path, workspace: &Path) -> Vec<String> {
        let target = target.to_string_lossy();
        let workspace = workspace.to_string_lossy();
        self.spec
            .args
            .iter()
            .map(|arg| {
                arg.replace("{target}", &target)
                    .replace("{workspace}", &workspace)
            })
            .collect()
    }
}

#[async_trait]
impl AnalysisTool for CommandTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> UnitKind {
        self.spec.kind
    }

    fn scope(&self) -> ToolScope {
        self.spec.scope
    }

    fn applies_to(&self, path: &Path) -> bool {
        self.spec.applies_to(path)
    }

    async fn probe(&self, timeout_ms: u64) -> ToolHealth {
        let started = std::time::Instant::now();
        let result = SubprocessExecutor::execute_command(
            &self.spec.program,
            &self.spec.probe_args,
            None,
            None,
            Some(timeout_ms),
            4096,
        )
        .await;

        let (status, detail) = match result {
            Ok(output) if output.success => {
                let first_line = output
                    .stdout
                    .lines()
                    .chain(output.stderr.lines())
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .unwrap_or("ok")
                    .to_string();
                (HealthStatus::Healthy, first_line)
            }
            Ok(output) => (
                HealthStatus::Unhealthy,
                format!("probe exited with status {:?}", output.exit_code),
            ),
            Err(ExecutorError::Spawn { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                (
                    HealthStatus::NotInstalled,
                    format!("{} not found", self.spec.program),
                )
            }
            Err(ExecutorError::TimedOut { timeout_ms, .. }) => (
                HealthStatus::Timeout,
                format!("probe timed out after {timeout_ms}ms"),
            ),
            Err(e) => (HealthStatus::Error, e.to_string()),
        };

        debug!("Probe of {} -> {status:?} ({detail})", self.spec.name);

        ToolHealth {
            tool_name: self.spec.name.clone(),
            status,
            detail,
            checked_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run(
        &self,
        target: &Path,
        workspace: &Path,
        timeout_ms: u64,
        max_output_bytes: usize,
    ) -> Result<ToolOutput, ToolRunError> {
        let args = self.render_args(target, workspace);
        let result = SubprocessExecutor::execute_command(
            &self.spec.program,
            &args,
            Some(workspace),
            None,
            Some(timeout_ms),
            max_output_bytes,
        )
        .await?;

        let success = result
            .exit_code
            .map(|code| self.spec.success_exit_codes.contains(&code))
            .unwrap_or(false);

        Ok(ToolOutput {
            success,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}
