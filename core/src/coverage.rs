//! Coverage Accountant
//!
//! Aggregates unit outcomes into discovered/analyzed/skipped counts and the
//! completeness status of a run. The accountant is owned by a single task
//! (see [`spawn_accountant`]); workers only send it [`UnitOutcome`] messages,
//! so the final counts do not depend on completion order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{
    AnalysisStatus, CoverageSummary, ExecutionFailure, FailureContext, FileUnitResult,
    ToolCounters, ToolScope, UnitStatus,
};
use crate::taxonomy::{FailureType, Severity, UnitKind};

/// A unit the orchestrator intends to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedUnit {
    /// Position in the plan; results are reported in this order
    pub seq: u64,
    pub tool_name: String,
    pub unit_kind: UnitKind,
    pub scope: ToolScope,
    pub file_path: PathBuf,
}

/// Message sent from a worker to the accountant
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub seq: u64,
    pub result: FileUnitResult,
}

/// Frozen result of aggregation
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub summary: CoverageSummary,
    /// Unit results in plan order
    pub unit_results: Vec<FileUnitResult>,
    /// Failures in plan order
    pub failures: Vec<ExecutionFailure>,
}

/// Coverage accountant
#[derive(Debug, Default)]
pub struct CoverageAccountant {
    discovered: Vec<PathBuf>,
    files_skipped: u64,
    planned: BTreeMap<u64, PlannedUnit>,
    results: BTreeMap<u64, FileUnitResult>,
    tools: BTreeMap<String, ToolCounters>,
}

impl CoverageAccountant {
    /// `discovered` is the file list handed over by discovery; `files_skipped`
    /// counts files discovery excluded upstream.
    pub fn new(discovered: &[PathBuf], files_skipped: u64) -> Self {
        let mut discovered = discovered.to_vec();
        discovered.sort();
        discovered.dedup();
        Self {
            discovered,
            files_skipped,
            ..Self::default()
        }
    }

    pub fn plan(&mut self, unit: PlannedUnit) {
        self.tools.entry(unit.tool_name.clone()).or_default().discovered += 1;
        self.planned.insert(unit.seq, unit);
    }

    pub fn planned_units(&self) -> impl Iterator<Item = &PlannedUnit> {
        self.planned.values()
    }

    /// Record one unit result. A second result for the same unit is ignored.
    pub fn record(&mut self, seq: u64, result: FileUnitResult) {
        if self.results.contains_key(&seq) {
            warn!("Ignoring duplicate result for unit {seq} ({})", result.tool_name);
            return;
        }
        if !self.planned.contains_key(&seq) {
            warn!("Recording unplanned unit {seq} ({})", result.tool_name);
            self.tools.entry(result.tool_name.clone()).or_default().discovered += 1;
        }

        let counters = self.tools.entry(result.tool_name.clone()).or_default();
        if result.status != UnitStatus::Skipped {
            counters.attempted += 1;
        }
        match result.status {
            UnitStatus::Success => counters.succeeded += 1,
            UnitStatus::Failed => counters.failed += 1,
            UnitStatus::TimedOut => counters.timed_out += 1,
            UnitStatus::Cancelled => counters.cancelled += 1,
            UnitStatus::Skipped => counters.skipped += 1,
        }

        debug!(
            "Recorded unit {seq}: {} on {} -> {}",
            result.tool_name,
            result.file_path.display(),
            result.status.as_str()
        );
        self.results.insert(seq, result);
    }

    /// Freeze the accountant into completeness fields.
    ///
    /// Planned units that never reported are recorded as tool failures rather
    /// than dropped.
    pub fn finalize(mut self) -> Aggregate {
        let missing: Vec<PlannedUnit> = self
            .planned
            .values()
            .filter(|unit| !self.results.contains_key(&unit.seq))
            .cloned()
            .collect();
        for unit in missing {
            warn!("Unit {} ({}) produced no result", unit.seq, unit.tool_name);
            let result = missing_result(&unit);
            self.record(unit.seq, result);
        }

        let files_discovered = self.discovered.len() as u64;
        let files_analyzed = self
            .discovered
            .iter()
            .filter(|file| self.file_analyzed(file))
            .count() as u64;

        let unit_results: Vec<FileUnitResult> = self.results.into_values().collect();
        let failures: Vec<ExecutionFailure> = unit_results
            .iter()
            .filter_map(|r| r.failure.clone())
            .collect();

        let coverage_percentage = if files_discovered == 0 {
            100.0
        } else {
            100.0 * files_analyzed as f64 / files_discovered as f64
        };

        let analysis_status =
            derive_status(&failures, files_analyzed, files_discovered);
        let completeness_context =
            completeness_context(&failures, files_analyzed, files_discovered);

        Aggregate {
            summary: CoverageSummary {
                files_discovered,
                files_analyzed,
                files_skipped: self.files_skipped,
                analysis_status,
                coverage_percentage,
                completeness_context,
                tool_counters: self.tools,
            },
            unit_results,
            failures,
        }
    }

    /// A file is analyzed when every unit covering it finished cleanly and at
    /// least one of them actually ran. Codebase-scope units only count for
    /// files no per-file tool covers.
    fn file_analyzed(&self, file: &Path) -> bool {
        let per_file: Vec<u64> = self
            .planned
            .values()
            .filter(|u| u.scope == ToolScope::PerFile && u.file_path == file)
            .map(|u| u.seq)
            .collect();

        let covering = if per_file.is_empty() {
            self.planned
                .values()
                .filter(|u| u.scope == ToolScope::Codebase)
                .map(|u| u.seq)
                .collect()
        } else {
            per_file
        };

        let statuses: Vec<UnitStatus> = covering
            .iter()
            .filter_map(|seq| self.results.get(seq).map(|r| r.status))
            .collect();

        statuses.len() == covering.len()
            && statuses.contains(&UnitStatus::Success)
            && statuses
                .iter()
                .all(|s| matches!(s, UnitStatus::Success | UnitStatus::Skipped))
    }
}

/// complete iff no tooling failure and every discovered file was analyzed;
/// failed iff nothing was analyzed and a tooling failure exists.
pub fn derive_status(
    failures: &[ExecutionFailure],
    files_analyzed: u64,
    files_discovered: u64,
) -> AnalysisStatus {
    let tooling_failure = failures.iter().any(|f| !f.is_analysis_finding);
    if !tooling_failure && files_analyzed == files_discovered {
        AnalysisStatus::Complete
    } else if files_analyzed == 0 && tooling_failure {
        AnalysisStatus::Failed
    } else {
        AnalysisStatus::Partial
    }
}

fn completeness_context(
    failures: &[ExecutionFailure],
    files_analyzed: u64,
    files_discovered: u64,
) -> String {
    // first failure of the highest severity
    let worst = failures.iter().fold(None::<&ExecutionFailure>, |worst, f| match worst {
        Some(w) if w.severity >= f.severity => Some(w),
        _ => Some(f),
    });

    match worst {
        None if files_analyzed == files_discovered => "Full analysis completed".to_string(),
        None => format!(
            "No applicable analysis tool for some files ({files_analyzed}/{files_discovered} files analyzed)"
        ),
        Some(f) => format!(
            "{} ({files_analyzed}/{files_discovered} files analyzed, {} failure{})",
            context_template(f.failure_type),
            failures.len(),
            if failures.len() == 1 { "" } else { "s" }
        ),
    }
}

fn context_template(failure_type: FailureType) -> &'static str {
    match failure_type {
        FailureType::ImportError => "Import error prevented analysis",
        FailureType::CircularImport => "Circular import prevented analysis",
        FailureType::SyntaxError => "Syntax error prevented analysis",
        FailureType::RuntimeError => "Runtime exception during analysis",
        FailureType::DependencyError => "Missing dependency prevented analysis",
        FailureType::Timeout => "Analysis timed out",
        FailureType::ToolError => "Analysis tool failed",
        FailureType::PermissionError => "Permission denied during analysis",
        FailureType::FileAccessError => "File could not be read",
        FailureType::ParsingError => "Tool output could not be parsed",
    }
}

fn missing_result(unit: &PlannedUnit) -> FileUnitResult {
    FileUnitResult {
        file_path: unit.file_path.clone(),
        tool_name: unit.tool_name.clone(),
        unit_kind: unit.unit_kind,
        scope: unit.scope,
        status: UnitStatus::Failed,
        duration_ms: 0,
        exit_code: None,
        output: None,
        failure: Some(ExecutionFailure {
            failure_type: FailureType::ToolError,
            severity: Severity::Error,
            message: "Unit produced no result".to_string(),
            context: FailureContext {
                file_path: unit.file_path.clone(),
                tool_name: unit.tool_name.clone(),
                unit_kind: unit.unit_kind,
            },
            raw_error: None,
            is_analysis_finding: false,
            timestamp: Utc::now(),
        }),
    }
}

/// Sending half of the accountant channel
#[derive(Debug, Clone)]
pub struct CoverageSink {
    tx: mpsc::UnboundedSender<UnitOutcome>,
}

impl CoverageSink {
    /// Returns false if the accountant task is gone
    pub fn record(&self, seq: u64, result: FileUnitResult) -> bool {
        self.tx.send(UnitOutcome { seq, result }).is_ok()
    }
}

/// Move the accountant into its own task.
///
/// The task ends, handing the accountant back, once every sink is dropped.
pub fn spawn_accountant(
    mut accountant: CoverageAccountant,
) -> (CoverageSink, JoinHandle<CoverageAccountant>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<UnitOutcome>();
    let handle = tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            accountant.record(outcome.seq, outcome.result);
        }
        accountant
    });
    (CoverageSink { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(acc: &mut CoverageAccountant, seq: u64, tool: &str, file: &str) {
        acc.plan(PlannedUnit {
            seq,
            tool_name: tool.to_string(),
            unit_kind: UnitKind::RuntimeProfile,
            scope: ToolScope::PerFile,
            file_path: PathBuf::from(file),
        });
    }

    fn result(tool: &str, file: &str, status: UnitStatus, finding: Option<bool>) -> FileUnitResult {
        FileUnitResult {
            file_path: PathBuf::from(file),
            tool_name: tool.to_string(),
            unit_kind: UnitKind::RuntimeProfile,
            scope: ToolScope::PerFile,
            status,
            duration_ms: 5,
            exit_code: Some(0),
            output: None,
            failure: finding.map(|is_finding| ExecutionFailure {
                failure_type: if is_finding {
                    FailureType::ImportError
                } else {
                    FailureType::ToolError
                },
                severity: Severity::Error,
                message: format!("{tool} failed on {file}"),
                context: FailureContext {
                    file_path: PathBuf::from(file),
                    tool_name: tool.to_string(),
                    unit_kind: UnitKind::RuntimeProfile,
                },
                raw_error: None,
                is_analysis_finding: is_finding,
                timestamp: Utc::now(),
            }),
        }
    }

    #[test]
    fn test_all_units_succeed_is_complete() {
        let files = vec![PathBuf::from("/p/a.py"), PathBuf::from("/p/b.py")];
        let mut acc = CoverageAccountant::new(&files, 0);
        plan(&mut acc, 0, "t", "/p/a.py");
        plan(&mut acc, 1, "t", "/p/b.py");
        acc.record(1, result("t", "/p/b.py", UnitStatus::Success, None));
        acc.record(0, result("t", "/p/a.py", UnitStatus::Success, None));

        let agg = acc.finalize();
        assert_eq!(agg.summary.analysis_status, AnalysisStatus::Complete);
        assert_eq!(agg.summary.coverage_percentage, 100.0);
        assert_eq!(agg.summary.completeness_context, "Full analysis completed");
        assert_eq!(agg.unit_results[0].file_path, PathBuf::from("/p/a.py"));
    }

    #[test]
    fn test_finding_only_failure_is_partial() {
        let files = vec![PathBuf::from("/p/a.py")];
        let mut acc = CoverageAccountant::new(&files, 0);
        plan(&mut acc, 0, "t", "/p/a.py");
        acc.record(0, result("t", "/p/a.py", UnitStatus::Failed, Some(true)));

        let agg = acc.finalize();
        assert_eq!(agg.summary.coverage_percentage, 0.0);
        assert_eq!(agg.summary.analysis_status, AnalysisStatus::Partial);
        assert!(agg
            .summary
            .completeness_context
            .starts_with("Import error prevented analysis"));
        assert_eq!(agg.failures.len(), 1);
    }

    #[test]
    fn test_tooling_failure_with_nothing_analyzed_is_failed() {
        let files = vec![PathBuf::from("/p/a.py")];
        let mut acc = CoverageAccountant::new(&files, 0);
        plan(&mut acc, 0, "t", "/p/a.py");
        acc.record(0, result("t", "/p/a.py", UnitStatus::Failed, Some(false)));

        assert_eq!(acc.finalize().summary.analysis_status, AnalysisStatus::Failed);
    }

    #[test]
    fn test_tooling_failure_never_complete() {
        let files = vec![PathBuf::from("/p/a.py")];
        let mut acc = CoverageAccountant::new(&files, 0);
        plan(&mut acc, 0, "good", "/p/a.py");
        acc.record(0, result("good", "/p/a.py", UnitStatus::Success, None));
        // a codebase tool crashed; the file itself is still analyzed
        acc.plan(PlannedUnit {
            seq: 1,
            tool_name: "whole".to_string(),
            unit_kind: UnitKind::StaticScan,
            scope: ToolScope::Codebase,
            file_path: PathBuf::from("/p"),
        });
        acc.record(1, result("whole", "/p", UnitStatus::Failed, Some(false)));

        let agg = acc.finalize();
        assert_eq!(agg.summary.coverage_percentage, 100.0);
        assert_eq!(agg.summary.analysis_status, AnalysisStatus::Partial);
    }

    #[test]
    fn test_zero_files_is_complete() {
        let agg = CoverageAccountant::new(&[], 3).finalize();
        assert_eq!(agg.summary.files_discovered, 0);
        assert_eq!(agg.summary.files_skipped, 3);
        assert_eq!(agg.summary.coverage_percentage, 100.0);
        assert_eq!(agg.summary.analysis_status, AnalysisStatus::Complete);
    }

    #[test]
    fn test_missing_results_become_failures() {
        let files = vec![PathBuf::from("/p/a.py")];
        let mut acc = CoverageAccountant::new(&files, 0);
        plan(&mut acc, 0, "t", "/p/a.py");

        let agg = acc.finalize();
        assert_eq!(agg.failures.len(), 1);
        assert_eq!(agg.failures[0].message, "Unit produced no result");
        assert_eq!(agg.summary.analysis_status, AnalysisStatus::Failed);
    }

    #[test]
    fn test_skipped_units_are_not_failures() {
        let files = vec![PathBuf::from("/p/a.py")];
        let mut acc = CoverageAccountant::new(&files, 0);
        plan(&mut acc, 0, "py", "/p/a.py");
        plan(&mut acc, 1, "js", "/p/a.py");
        acc.record(0, result("py", "/p/a.py", UnitStatus::Success, None));
        acc.record(1, result("js", "/p/a.py", UnitStatus::Skipped, None));

        let agg = acc.finalize();
        assert_eq!(agg.summary.analysis_status, AnalysisStatus::Complete);
        let js = agg.summary.tool_counters["js"];
        assert_eq!(js.skipped, 1);
        assert_eq!(js.attempted, 0);
    }

    #[test]
    fn test_duplicate_record_is_ignored() {
        let files = vec![PathBuf::from("/p/a.py")];
        let mut acc = CoverageAccountant::new(&files, 0);
        plan(&mut acc, 0, "t", "/p/a.py");
        acc.record(0, result("t", "/p/a.py", UnitStatus::Success, None));
        acc.record(0, result("t", "/p/a.py", UnitStatus::Failed, Some(false)));

        let agg = acc.finalize();
        assert_eq!(agg.summary.tool_counters["t"].attempted, 1);
        assert!(agg.failures.is_empty());
    }

    #[test]
    fn test_worst_severity_picks_context() {
        let failures = vec![
            {
                let mut r = result("t", "/p/a.py", UnitStatus::Failed, Some(true));
                r.failure.as_mut().unwrap().severity = Severity::Warning;
                r.failure.unwrap()
            },
            {
                let mut r = result("t", "/p/b.py", UnitStatus::Failed, Some(false));
                r.failure.as_mut().unwrap().severity = Severity::Critical;
                r.failure.unwrap()
            },
        ];
        let ctx = completeness_context(&failures, 0, 2);
        assert!(ctx.starts_with("Analysis tool failed"));
        assert!(ctx.contains("2 failures"));
    }

    #[tokio::test]
    async fn test_accumulator_counts_are_order_independent() {
        let files: Vec<PathBuf> = (0..20).map(|i| PathBuf::from(format!("/p/{i}.py"))).collect();
        let mut acc = CoverageAccountant::new(&files, 0);
        for (seq, file) in files.iter().enumerate() {
            plan(&mut acc, seq as u64, "t", file.to_str().unwrap());
        }
        let (sink, handle) = spawn_accountant(acc);

        let mut tasks = Vec::new();
        for (seq, file) in files.iter().enumerate().rev() {
            let sink = sink.clone();
            let file = file.to_string_lossy().into_owned();
            tasks.push(tokio::spawn(async move {
                let status = if seq % 2 == 0 {
                    UnitStatus::Success
                } else {
                    UnitStatus::Failed
                };
                let finding = (status == UnitStatus::Failed).then_some(true);
                sink.record(seq as u64, result("t", &file, status, finding));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        drop(sink);

        let agg = handle.await.unwrap().finalize();
        assert_eq!(agg.summary.files_analyzed, 10);
        assert_eq!(agg.summary.coverage_percentage, 50.0);
        assert_eq!(agg.failures.len(), 10);
        assert_eq!(agg.failures[0].context.file_path, PathBuf::from("/p/1.py"));
    }
}
