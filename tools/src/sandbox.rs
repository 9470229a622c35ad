//! Execution Sandbox
//!
//! Runs one analysis unit in isolation and always returns a
//! [`FileUnitResult`]; nothing that goes wrong inside a unit is propagated to
//! the caller as an error.
//!
//! Every unit gets its own scratch directory and its tool runs on a separate
//! task. On timeout or cancellation the task is aborted and awaited, which
//! drops the child process handle (killing it) before the scratch directory
//! is removed.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use veritas_core::{
    classify, classify_stderr, ExecutionFailure, FailureContext, FailureSignal, FileUnitResult,
    ToolScope, UnitKind, UnitStatus,
};

use crate::health::HealthRegistry;
use crate::tool_models::{AnalysisUnit, ToolOutput, ToolRunError};

/// Extra time a tool gets beyond its own timeout before the sandbox aborts it
const ABORT_GRACE_MS: u64 = 2_000;

/// Execution sandbox
#[derive(Clone)]
pub struct Sandbox {
    health: Arc<HealthRegistry>,
    max_output_bytes: usize,
}

/// How the tool task ended
enum Ending {
    Finished(Result<ToolOutput, ToolRunError>),
    Panicked(String),
    TimedOut,
    Cancelled,
}

impl Sandbox {
    pub fn new(health: Arc<HealthRegistry>, max_output_bytes: usize) -> Self {
        Self {
            health,
            max_output_bytes,
        }
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Execute `unit` with a wall-clock budget of `timeout_ms`
    pub async fn execute(
        &self,
        unit: &AnalysisUnit,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> FileUnitResult {
        let started = Instant::now();
        let tool = &unit.tool;
        let report = UnitReport {
            target: &unit.target,
            tool_name: tool.name(),
            kind: tool.kind(),
            scope: tool.scope(),
            started,
        };

        if cancel.is_cancelled() {
            return report.failed(
                UnitStatus::Cancelled,
                &FailureSignal::Cancelled,
                None,
                None,
            );
        }

        if tool.scope() == ToolScope::PerFile && !tool.applies_to(&unit.target) {
            return report.skipped();
        }

        let health = tokio::select! {
            health = self.health.check(tool.as_ref()) => health,
            _ = cancel.cancelled() => {
                return report.failed(UnitStatus::Cancelled, &FailureSignal::Cancelled, None, None);
            }
        };
        if !health.status.is_healthy() {
            let detail = format!("{:?}: {}", health.status, health.detail);
            return report.failed(
                UnitStatus::Failed,
                &FailureSignal::ProbeFailed {
                    tool: tool.name(),
                    detail: &detail,
                },
                None,
                None,
            );
        }

        if let Err(e) = tokio::fs::metadata(&unit.target).await {
            let detail = format!("{}: {e}", unit.target.display());
            return report.failed(
                UnitStatus::Failed,
                &FailureSignal::FileAccess { detail: &detail },
                None,
                None,
            );
        }

        let workspace = match tempfile::Builder::new().prefix("veritas-unit-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                let detail = e.to_string();
                return report.failed(
                    UnitStatus::Failed,
                    &FailureSignal::Workspace { detail: &detail },
                    None,
                    None,
                );
            }
        };

        let ending = self.run_isolated(unit, workspace.path(), timeout_ms, cancel).await;

        if let Err(e) = workspace.close() {
            warn!("Failed to remove unit workspace for {}: {e}", tool.name());
        }

        match ending {
            Ending::Finished(Ok(output)) => self.from_output(&report, output),
            Ending::Finished(Err(ToolRunError::Spawn {
                kind,
                program,
                detail,
            })) => report.failed(
                UnitStatus::Failed,
                &FailureSignal::SpawnFailed {
                    kind,
                    program: &program,
                    detail: &detail,
                },
                None,
                Some(detail.clone()),
            ),
            Ending::Finished(Err(ToolRunError::TimedOut { .. })) | Ending::TimedOut => report
                .failed(
                    UnitStatus::TimedOut,
                    &FailureSignal::TimedOut { timeout_ms },
                    None,
                    None,
                ),
            Ending::Finished(Err(ToolRunError::Io(detail))) => report.failed(
                UnitStatus::Failed,
                &FailureSignal::ToolIo { detail: &detail },
                None,
                None,
            ),
            Ending::Panicked(detail) => report.failed(
                UnitStatus::Failed,
                &FailureSignal::Panicked { detail: &detail },
                None,
                None,
            ),
            Ending::Cancelled => report.failed(
                UnitStatus::Cancelled,
                &FailureSignal::Cancelled,
                None,
                None,
            ),
        }
    }

    async fn run_isolated(
        &self,
        unit: &AnalysisUnit,
        workspace: &Path,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> Ending {
        let tool = Arc::clone(&unit.tool);
        let target = unit.target.clone();
        let workspace = workspace.to_path_buf();
        let max_output_bytes = self.max_output_bytes;

        let mut handle = tokio::spawn(async move {
            tool.run(&target, &workspace, timeout_ms, max_output_bytes)
                .await
        });

        let deadline = Duration::from_millis(timeout_ms.saturating_add(ABORT_GRACE_MS));
        let ending = tokio::select! {
            joined = &mut handle => return joined_ending(joined),
            _ = tokio::time::sleep(deadline) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        handle.abort();
        // the aborted task drops the child process before we return
        let _ = handle.await;
        ending
    }

    fn from_output(&self, report: &UnitReport<'_>, output: ToolOutput) -> FileUnitResult {
        // already capped by the tool
        let stdout = output.stdout.clone();
        let raw = (!output.stderr.is_empty()).then(|| output.stderr.clone());

        if output.success {
            if let Some(classification) = classify_stderr(&output.stderr, report.kind) {
                debug!(
                    "{} exited cleanly but reported {} for {}",
                    report.tool_name,
                    classification.failure_type,
                    report.target.display()
                );
                let failure = ExecutionFailure::from_classification(
                    classification,
                    report.context(),
                    raw,
                );
                return report.finish(UnitStatus::Failed, output.exit_code, Some(stdout), Some(failure));
            }
            return report.finish(UnitStatus::Success, output.exit_code, Some(stdout), None);
        }

        let signal = FailureSignal::Exited {
            code: output.exit_code,
            stderr: &output.stderr,
        };
        let classification = classify(&signal, report.kind);
        let failure = ExecutionFailure::from_classification(classification, report.context(), raw);
        report.finish(UnitStatus::Failed, output.exit_code, Some(stdout), Some(failure))
    }
}

fn joined_ending(joined: Result<Result<ToolOutput, ToolRunError>, JoinError>) -> Ending {
    match joined {
        Ok(result) => Ending::Finished(result),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Ending::Panicked(detail)
        }
        Err(_) => Ending::Cancelled,
    }
}

/// Fields shared by every result of one unit
struct UnitReport<'a> {
    target: &'a Path,
    tool_name: &'a str,
    kind: UnitKind,
    scope: ToolScope,
    started: Instant,
}

impl UnitReport<'_> {
    fn context(&self) -> FailureContext {
        FailureContext {
            file_path: self.target.to_path_buf(),
            tool_name: self.tool_name.to_string(),
            unit_kind: self.kind,
        }
    }

    fn finish(
        &self,
        status: UnitStatus,
        exit_code: Option<i32>,
        output: Option<String>,
        failure: Option<ExecutionFailure>,
    ) -> FileUnitResult {
        FileUnitResult {
            file_path: self.target.to_path_buf(),
            tool_name: self.tool_name.to_string(),
            unit_kind: self.kind,
            scope: self.scope,
            status,
            duration_ms: self.started.elapsed().as_millis() as u64,
            exit_code,
            output,
            failure,
        }
    }

    fn skipped(&self) -> FileUnitResult {
        self.finish(UnitStatus::Skipped, None, None, None)
    }

    fn failed(
        &self,
        status: UnitStatus,
        signal: &FailureSignal<'_>,
        exit_code: Option<i32>,
        raw_error: Option<String>,
    ) -> FileUnitResult {
        let classification = classify(signal, self.kind);
        debug!(
            "{} on {} -> {} ({})",
            self.tool_name,
            self.target.display(),
            classification.failure_type,
            classification.rule
        );
        let failure = ExecutionFailure::from_classification(classification, self.context(), raw_error);
        self.finish(status, exit_code, None, Some(failure))
    }
}
