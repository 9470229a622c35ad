//! Data model shared by every stage of a run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::VeritasError;
use crate::taxonomy::{Classification, FailureType, Severity, UnitKind};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Monotonic identifier of a persisted run
    RunId
);
id_type!(
    /// Monotonic identifier of a persisted failure
    RecordId
);
id_type!(
    /// Identifier of a vector in the error memory; derived from the record
    /// that first created it
    VectorId
);

impl From<RecordId> for VectorId {
    fn from(record_id: RecordId) -> Self {
        VectorId(record_id.0)
    }
}

/// Where a failure was observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    pub file_path: PathBuf,
    pub tool_name: String,
    pub unit_kind: UnitKind,
}

/// One detected problem during an attempted analysis unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub failure_type: FailureType,
    pub severity: Severity,
    pub message: String,
    pub context: FailureContext,
    /// Full stderr; never used for matching
    pub raw_error: Option<String>,
    pub is_analysis_finding: bool,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionFailure {
    pub fn from_classification(
        classification: Classification,
        context: FailureContext,
        raw_error: Option<String>,
    ) -> Self {
        Self {
            failure_type: classification.failure_type,
            severity: classification.severity,
            message: classification.message,
            context,
            raw_error,
            is_analysis_finding: classification.is_analysis_finding,
            timestamp: Utc::now(),
        }
    }

    /// Fields that identify the same condition across runs
    pub fn identity(&self) -> (FailureType, &str, &Path, &str) {
        (
            self.failure_type,
            self.message.as_str(),
            self.context.file_path.as_path(),
            self.context.tool_name.as_str(),
        )
    }
}

/// Outcome of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Success,
    Failed,
    TimedOut,
    /// Not applicable to the target; never a failure
    Skipped,
    /// Stopped by run-level cancellation
    Cancelled,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Success => "SUCCESS",
            UnitStatus::Failed => "FAILED",
            UnitStatus::TimedOut => "TIMED_OUT",
            UnitStatus::Skipped => "SKIPPED",
            UnitStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for UnitStatus {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(UnitStatus::Success),
            "FAILED" => Ok(UnitStatus::Failed),
            "TIMED_OUT" => Ok(UnitStatus::TimedOut),
            "SKIPPED" => Ok(UnitStatus::Skipped),
            "CANCELLED" => Ok(UnitStatus::Cancelled),
            _ => Err(VeritasError::UnknownVariant {
                kind: "unit status",
                value: s.to_string(),
            }),
        }
    }
}

/// Whether a tool runs once per file or once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolScope {
    #[default]
    PerFile,
    Codebase,
}

impl ToolScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolScope::PerFile => "per_file",
            ToolScope::Codebase => "codebase",
        }
    }
}

impl FromStr for ToolScope {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_file" => Ok(ToolScope::PerFile),
            "codebase" => Ok(ToolScope::Codebase),
            _ => Err(VeritasError::UnknownVariant {
                kind: "tool scope",
                value: s.to_string(),
            }),
        }
    }
}

/// Outcome of running one tool against one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUnitResult {
    /// Target file, or the first root path for codebase-scope tools
    pub file_path: PathBuf,
    pub tool_name: String,
    pub unit_kind: UnitKind,
    pub scope: ToolScope,
    pub status: UnitStatus,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    /// Captured tool output, truncated to the configured limit
    pub output: Option<String>,
    pub failure: Option<ExecutionFailure>,
}

impl FileUnitResult {
    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Success
    }

    /// Whether the tool ran to completion on its target, so its outcome
    /// says something about the code. Timeouts, cancellations and tools that
    /// never exited observed nothing.
    pub fn observed_target(&self) -> bool {
        match self.status {
            UnitStatus::Success => true,
            UnitStatus::Failed => self.exit_code.is_some(),
            UnitStatus::TimedOut | UnitStatus::Cancelled | UnitStatus::Skipped => false,
        }
    }
}

/// Overall completeness of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Complete,
    Partial,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Partial => "partial",
            AnalysisStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(AnalysisStatus::Complete),
            "partial" => Ok(AnalysisStatus::Partial),
            "failed" => Ok(AnalysisStatus::Failed),
            _ => Err(VeritasError::UnknownVariant {
                kind: "analysis status",
                value: s.to_string(),
            }),
        }
    }
}

/// Health probe outcome for one tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    NotInstalled,
    Timeout,
    Error,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health probe report entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolHealth {
    pub tool_name: String,
    pub status: HealthStatus,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Per-tool unit counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCounters {
    /// Units planned for this tool
    pub discovered: u64,
    /// Units that produced a result other than SKIPPED
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub skipped: u64,
}

/// Completeness fields produced when aggregation finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub files_discovered: u64,
    pub files_analyzed: u64,
    pub files_skipped: u64,
    pub analysis_status: AnalysisStatus,
    pub coverage_percentage: f64,
    pub completeness_context: String,
    pub tool_counters: BTreeMap<String, ToolCounters>,
}

/// One invocation of the pipeline over a set of root paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    /// Assigned by the store when the run is persisted
    pub run_id: Option<RunId>,
    /// Correlates log lines of one invocation
    pub invocation_id: Uuid,
    pub root_paths: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub files_discovered: u64,
    pub files_analyzed: u64,
    pub files_skipped: u64,
    pub failures: Vec<ExecutionFailure>,
    pub unit_results: Vec<FileUnitResult>,
    pub analysis_status: AnalysisStatus,
    pub coverage_percentage: f64,
    pub completeness_context: String,
    pub tool_health: Vec<ToolHealth>,
    pub tool_counters: BTreeMap<String, ToolCounters>,
}

impl AnalysisRun {
    /// A run that has not discovered or executed anything yet
    pub fn new(root_paths: Vec<PathBuf>) -> Self {
        Self {
            run_id: None,
            invocation_id: Uuid::new_v4(),
            root_paths,
            started_at: Utc::now(),
            finished_at: None,
            files_discovered: 0,
            files_analyzed: 0,
            files_skipped: 0,
            failures: Vec::new(),
            unit_results: Vec::new(),
            analysis_status: AnalysisStatus::Partial,
            coverage_percentage: 0.0,
            completeness_context: "Analysis not finished".to_string(),
            tool_health: Vec::new(),
            tool_counters: BTreeMap::new(),
        }
    }

    /// Key used to decide which remembered errors a run can resolve
    pub fn scope_key(&self) -> String {
        scope_key(&self.root_paths)
    }

    pub fn apply_coverage(&mut self, summary: CoverageSummary) {
        self.files_discovered = summary.files_discovered;
        self.files_analyzed = summary.files_analyzed;
        self.files_skipped = summary.files_skipped;
        self.analysis_status = summary.analysis_status;
        self.coverage_percentage = summary.coverage_percentage;
        self.completeness_context = summary.completeness_context;
        self.tool_counters = summary.tool_counters;
    }

    /// Failures that reflect this system's tooling rather than the analysed code
    pub fn tooling_failures(&self) -> impl Iterator<Item = &ExecutionFailure> {
        self.failures.iter().filter(|f| !f.is_analysis_finding)
    }

    /// Targets with at least one applicable unit that did not observe them
    pub fn unsettled_targets(&self) -> BTreeSet<PathBuf> {
        self.unit_results
            .iter()
            .filter(|u| u.status != UnitStatus::Skipped && !u.observed_target())
            .map(|u| u.file_path.clone())
            .collect()
    }

    /// Whether `failure` only records that its unit was cancelled
    pub fn is_cancellation(&self, failure: &ExecutionFailure) -> bool {
        self.unit_results.iter().any(|u| {
            u.status == UnitStatus::Cancelled
                && u.tool_name == failure.context.tool_name
                && u.file_path == failure.context.file_path
        })
    }
}

/// Sorted, de-duplicated root paths joined with newlines
pub fn scope_key(root_paths: &[PathBuf]) -> String {
    let mut roots: Vec<String> = root_paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    roots.sort();
    roots.dedup();
    roots.join("\n")
}
