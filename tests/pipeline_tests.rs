//! End-to-end runs through the orchestrator
//!
//! Covers:
//! - import errors reported as findings with zero coverage
//! - empty roots
//! - timeout isolation between units
//! - cancellation of an in-flight run
//! - recurring, new and resolved failures across runs
//! - error memory surviving a restart and a lost index file
//! - remembered errors kept across timed-out and cancelled runs
//! - roots whose names contain glob metacharacters
//!
//! Tools are small `sh` scripts so the tests only need a POSIX shell.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use veritas::cli::{exit_code_for_report, EXIT_COMPLETE, EXIT_PARTIAL, EXIT_TOOL_FAILURE};
use veritas::{Orchestrator, RunReport};
use veritas_core::{
    AnalysisStatus, FailureType, ToolSpec, UnitKind, UnitStatus, VeritasConfig,
};
use veritas_databases::FailureFilter;

const IMPORT_CHECK: &str = r#"if grep -q missing_mod "$1"; then
  echo "Traceback (most recent call last):" >&2
  echo "ModuleNotFoundError: No module named 'missing_mod'" >&2
  exit 1
fi
exit 0"#;

fn sh_tool(name: &str, kind: UnitKind, script: &str) -> ToolSpec {
    let mut spec = ToolSpec::new(name, kind, "sh", &["-c", script, "sh", "{target}"]);
    spec.probe_args = vec!["-c".to_string(), "exit 0".to_string()];
    spec
}

fn config(state: &Path, tools: Vec<ToolSpec>) -> VeritasConfig {
    let mut config = VeritasConfig::default();
    config.storage.database_path = state.join("veritas.db");
    config.memory.index_path = state.join("error_memory.idx");
    config.tools = tools;
    config
}

fn project(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(&src).unwrap();
    for (name, body) in files {
        fs::write(src.join(name), body).unwrap();
    }
    (dir, src)
}

async fn run_once(config: &VeritasConfig, root: &Path) -> RunReport {
    let orchestrator = Orchestrator::open(config.clone()).await.unwrap();
    orchestrator
        .run(vec![root.to_path_buf()], CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_import_error_is_a_finding_with_zero_coverage() {
    let (dir, src) = project(&[("app.py", "import missing_mod\n")]);
    let config = config(
        &dir.path().join("state"),
        vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)],
    );

    let report = run_once(&config, &src).await;
    let run = &report.run;

    assert_eq!(run.files_discovered, 1);
    assert_eq!(run.files_analyzed, 0);
    assert_eq!(run.coverage_percentage, 0.0);
    assert_eq!(run.analysis_status, AnalysisStatus::Partial);
    assert_eq!(run.failures.len(), 1);

    let failure = &run.failures[0];
    assert_eq!(failure.failure_type, FailureType::ImportError);
    assert!(failure.is_analysis_finding);
    assert!(failure.message.contains("missing_mod"));
    assert!(run.completeness_context.starts_with("Import error prevented analysis"));

    assert_eq!(report.matches.new.len(), 1);
    assert_eq!(exit_code_for_report(&report), EXIT_PARTIAL);
}

#[tokio::test]
async fn test_static_scan_import_error_is_tooling() {
    let (dir, src) = project(&[("app.py", "import missing_mod\n")]);
    let config = config(
        &dir.path().join("state"),
        vec![sh_tool("scanner", UnitKind::StaticScan, IMPORT_CHECK)],
    );

    let report = run_once(&config, &src).await;
    assert!(!report.run.failures[0].is_analysis_finding);
    assert_eq!(report.run.analysis_status, AnalysisStatus::Failed);
}

#[tokio::test]
async fn test_empty_root_is_complete() {
    let (dir, src) = project(&[]);
    let config = config(
        &dir.path().join("state"),
        vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)],
    );

    let report = run_once(&config, &src).await;
    assert_eq!(report.run.files_discovered, 0);
    assert_eq!(report.run.coverage_percentage, 100.0);
    assert_eq!(report.run.analysis_status, AnalysisStatus::Complete);
    assert!(report.run.unit_results.is_empty());
    assert_eq!(exit_code_for_report(&report), EXIT_COMPLETE);
}

#[tokio::test]
async fn test_slow_unit_times_out_without_affecting_others() {
    let (dir, src) = project(&[("fast.py", "x = 1\n"), ("slow.py", "y = 2\n")]);
    let mut tool = sh_tool(
        "tracer",
        UnitKind::Trace,
        r#"case "$1" in *slow*) exec sleep 10;; esac; exit 0"#,
    );
    tool.timeout_ms = Some(300);
    let config = config(&dir.path().join("state"), vec![tool]);

    let started = Instant::now();
    let report = run_once(&config, &src).await;
    assert!(started.elapsed() < Duration::from_secs(8));

    let status_of = |name: &str| {
        report
            .run
            .unit_results
            .iter()
            .find(|u| u.file_path.ends_with(name))
            .map(|u| u.status)
            .unwrap()
    };
    assert_eq!(status_of("fast.py"), UnitStatus::Success);
    assert_eq!(status_of("slow.py"), UnitStatus::TimedOut);

    assert_eq!(report.run.files_analyzed, 1);
    assert_eq!(report.run.coverage_percentage, 50.0);
    assert_eq!(report.run.analysis_status, AnalysisStatus::Partial);
    assert_eq!(report.run.failures[0].failure_type, FailureType::Timeout);
    assert_eq!(report.run.tool_counters["tracer"].timed_out, 1);
    assert_eq!(exit_code_for_report(&report), EXIT_TOOL_FAILURE);
}

#[tokio::test]
async fn test_cancel_stops_outstanding_units() {
    let (dir, src) = project(&[("a.py", "x = 1\n"), ("b.py", "y = 2\n")]);
    let config = config(
        &dir.path().join("state"),
        vec![sh_tool("tracer", UnitKind::Trace, "exec sleep 10")],
    );
    let orchestrator = Orchestrator::open(config).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = orchestrator.run(vec![src], cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(8));

    assert!(report.cancelled);
    assert!(!report.run_timed_out);
    assert_eq!(report.run.files_analyzed, 0);
    assert_eq!(report.run.analysis_status, AnalysisStatus::Failed);
    assert!(report
        .run
        .unit_results
        .iter()
        .all(|u| u.status == UnitStatus::Cancelled));
}

#[tokio::test]
async fn test_run_timeout_cancels_remaining_units() {
    let (dir, src) = project(&[("a.py", "x = 1\n")]);
    let mut config = config(
        &dir.path().join("state"),
        vec![sh_tool("tracer", UnitKind::Trace, "exec sleep 10")],
    );
    config.execution.run_timeout_ms = Some(300);

    let report = run_once(&config, &src).await;
    assert!(report.run_timed_out);
    assert!(!report.cancelled);
    assert_eq!(report.run.unit_results[0].status, UnitStatus::Cancelled);
}

#[tokio::test]
async fn test_rerun_recognises_recurring_failures() {
    let (dir, src) = project(&[("a.py", "import missing_mod\n"), ("b.py", "x = 1\n")]);
    let config = config(
        &dir.path().join("state"),
        vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)],
    );

    let first = run_once(&config, &src).await;
    assert_eq!(first.matches.new.len(), 1);

    let second = run_once(&config, &src).await;
    assert!(second.matches.is_unchanged());
    assert_eq!(second.matches.recurring, first.matches.new);
    assert!(second.run.run_id > first.run.run_id);
}

#[tokio::test]
async fn test_fixed_and_introduced_failures() {
    let (dir, src) = project(&[
        ("a.py", "import missing_mod\n"),
        ("b.py", "import missing_mod\n"),
        ("c.py", "x = 1\n"),
    ]);
    let config = config(
        &dir.path().join("state"),
        vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)],
    );

    let first = run_once(&config, &src).await;
    assert_eq!(first.matches.new.len(), 2);
    let vector_of = |report: &RunReport, file: &str| {
        let index = report
            .run
            .failures
            .iter()
            .position(|f| f.context.file_path.ends_with(file))
            .unwrap();
        report.matches.assignments[index].vector_id
    };
    let a_vector = vector_of(&first, "a.py");
    let b_vector = vector_of(&first, "b.py");

    fs::write(src.join("a.py"), "x = 1\n").unwrap();
    fs::write(src.join("c.py"), "import missing_mod\n").unwrap();

    let second = run_once(&config, &src).await;
    assert_eq!(second.matches.recurring, vec![b_vector]);
    assert_eq!(second.matches.resolved, vec![a_vector]);
    assert_eq!(second.matches.new.len(), 1);
    assert_eq!(vector_of(&second, "c.py"), second.matches.new[0]);
}

#[tokio::test]
async fn test_failures_are_queryable_after_the_run() {
    let (dir, src) = project(&[("a.py", "import missing_mod\n"), ("b.py", "x = 1\n")]);
    let config = config(
        &dir.path().join("state"),
        vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)],
    );
    let report = run_once(&config, &src).await;

    let orchestrator = Orchestrator::open(config).await.unwrap();
    let store = orchestrator.store();
    let stored = store
        .list_failures(&FailureFilter {
            failure_type: Some(FailureType::ImportError),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(Some(stored[0].run_id), report.run.run_id);

    let runs = store.list_runs(5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].files_discovered, 2);
    assert_eq!(runs[0].failure_count, 1);
}

#[tokio::test]
async fn test_memory_survives_restart_and_lost_index() {
    let (dir, src) = project(&[("a.py", "import missing_mod\n")]);
    let state = dir.path().join("state");
    let config = config(
        &state,
        vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)],
    );

    let first = run_once(&config, &src).await;
    assert!(state.join("error_memory.idx").exists());

    // Index lost after the run was committed
    fs::remove_file(state.join("error_memory.idx")).unwrap();

    let orchestrator = Orchestrator::open(config.clone()).await.unwrap();
    assert_eq!(orchestrator.memory().len().await, 1);

    let second = orchestrator
        .run(vec![src], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.matches.recurring, first.matches.new);
    assert!(second.matches.new.is_empty());
}

#[tokio::test]
async fn test_timed_out_run_keeps_remembered_errors() {
    let (dir, src) = project(&[("app.py", "import missing_mod\n")]);
    let state = dir.path().join("state");
    let failing = config(&state, vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)]);
    let first = run_once(&failing, &src).await;
    assert_eq!(first.matches.new.len(), 1);

    let mut hanging = sh_tool("tracer", UnitKind::Trace, "exec sleep 10");
    hanging.timeout_ms = Some(300);
    let second = run_once(&config(&state, vec![hanging]), &src).await;
    assert_eq!(second.run.unit_results[0].status, UnitStatus::TimedOut);
    assert!(second.matches.resolved.is_empty());

    let third = run_once(&failing, &src).await;
    assert_eq!(third.matches.recurring, first.matches.new);
    assert!(third.matches.new.is_empty());
}

#[tokio::test]
async fn test_cancelled_run_keeps_remembered_errors() {
    let (dir, src) = project(&[("app.py", "import missing_mod\n")]);
    let state = dir.path().join("state");
    let failing = config(&state, vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)]);
    let first = run_once(&failing, &src).await;

    let orchestrator = Orchestrator::open(config(
        &state,
        vec![sh_tool("tracer", UnitKind::Trace, "exec sleep 10")],
    ))
    .await
    .unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let second = orchestrator.run(vec![src.clone()], cancel).await.unwrap();
    assert!(second.cancelled);
    assert!(second.matches.resolved.is_empty());
    assert!(second.matches.new.is_empty());
    assert!(second.matches.assignments.is_empty());
    drop(orchestrator);

    let third = run_once(&failing, &src).await;
    assert_eq!(third.matches.recurring, first.matches.new);
    assert!(third.matches.is_unchanged());
}

#[tokio::test]
async fn test_root_with_glob_metacharacters_is_discovered() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("proj[1]");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("app.py"), "x = 1\n").unwrap();
    let config = config(
        &dir.path().join("state"),
        vec![sh_tool("tracer", UnitKind::Trace, IMPORT_CHECK)],
    );

    let report = run_once(&config, &root).await;
    assert_eq!(report.run.files_discovered, 1);
    assert_eq!(report.run.files_analyzed, 1);
    assert_eq!(report.run.analysis_status, AnalysisStatus::Complete);
}
