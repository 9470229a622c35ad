//! CLI subcommand dispatch
//!
//! Dispatches to the subcommand handlers and maps their outcome to a
//! process exit code:
//! - run: analyse roots, exit code from the run's completeness
//! - health: probe configured tools
//! - history: query the run store
//! - reconcile: repair drift between the run store and the error memory

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use veritas_core::{AnalysisStatus, VeritasConfig, VeritasError};
use veritas_databases::{FailureFilter, RunStore};
use veritas_memory::ErrorMemory;
use veritas_tools::ToolManager;

use crate::cli::{
    Args, Command, Error, Result, EXIT_COMPLETE, EXIT_FAILED, EXIT_INPUT_ERROR, EXIT_PARTIAL,
    EXIT_RUN_TIMEOUT, EXIT_TOOLS_UNHEALTHY, EXIT_TOOL_FAILURE,
};
use crate::orchestrator::{Orchestrator, RunReport};

/// Exit code wrapper for CLI operations
pub type ExitCode = i32;

/// Run the parsed command against `config` and return the exit code
pub async fn run_cli_mode(args: Args, mut config: VeritasConfig) -> ExitCode {
    let json = args.json;
    let wants_failures = args.command.wants_failures();
    let outcome = match args.command {
        Command::Run {
            roots,
            run_timeout_ms,
            pool_size,
        } => {
            if run_timeout_ms.is_some() {
                config.execution.run_timeout_ms = run_timeout_ms;
            }
            if pool_size.is_some() {
                config.execution.pool_size = pool_size;
            }
            run_mode(config, roots, json).await
        }
        Command::Health => health_mode(config, json).await,
        history @ Command::History { .. } => {
            history_mode(config, history, wants_failures, json).await
        }
        Command::Reconcile => reconcile_mode(config, json).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            match &e {
                Error::Veritas(inner) => exit_code_for_error(inner),
                _ => EXIT_FAILED,
            }
        }
    }
}

/// Exit code for a run that reached DONE
pub fn exit_code_for_report(report: &RunReport) -> ExitCode {
    let run = &report.run;
    if report.run_timed_out {
        return EXIT_RUN_TIMEOUT;
    }
    if !run.tool_health.is_empty() && run.tool_health.iter().all(|h| !h.status.is_healthy()) {
        return EXIT_TOOLS_UNHEALTHY;
    }
    match run.analysis_status {
        AnalysisStatus::Complete => EXIT_COMPLETE,
        AnalysisStatus::Failed => EXIT_FAILED,
        AnalysisStatus::Partial if run.tooling_failures().next().is_some() => EXIT_TOOL_FAILURE,
        AnalysisStatus::Partial => EXIT_PARTIAL,
    }
}

/// Exit code for a run that ended in FAILED
pub fn exit_code_for_error(error: &VeritasError) -> ExitCode {
    match error {
        VeritasError::RootNotFound(_)
        | VeritasError::NoRoots
        | VeritasError::InvalidConfig(_)
        | VeritasError::UnknownVariant { .. }
        | VeritasError::Config(_) => EXIT_INPUT_ERROR,
        _ => EXIT_FAILED,
    }
}

async fn run_mode(config: VeritasConfig, roots: Vec<PathBuf>, json: bool) -> Result<ExitCode> {
    let orchestrator = Orchestrator::open(config).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling run");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator.run(roots, cancel).await;
    interrupt.abort();
    let report = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_summary(&report);
    }
    Ok(exit_code_for_report(&report))
}

fn print_run_summary(report: &RunReport) {
    let run = &report.run;
    println!(
        "Run {}: {}",
        run.run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
        run.analysis_status
    );
    println!(
        "  Coverage: {}/{} file(s) analysed ({:.1}%), {} skipped",
        run.files_analyzed, run.files_discovered, run.coverage_percentage, run.files_skipped
    );
    println!("  {}", run.completeness_context);
    if report.run_timed_out {
        println!("  Run timeout reached; outstanding units were cancelled");
    }
    if report.cancelled {
        println!("  Run was interrupted; outstanding units were cancelled");
    }

    for health in run.tool_health.iter().filter(|h| !h.status.is_healthy()) {
        println!(
            "  Tool {} is {:?}: {}",
            health.tool_name, health.status, health.detail
        );
    }
    for failure in &run.failures {
        let origin = if failure.is_analysis_finding {
            "finding"
        } else {
            "tooling"
        };
        println!(
            "  [{}] {} {} ({}, {}): {}",
            failure.severity,
            failure.failure_type,
            failure.context.file_path.display(),
            failure.context.tool_name,
            origin,
            failure.message
        );
    }

    let matches = &report.matches;
    println!(
        "  Memory: {} recurring, {} new, {} resolved",
        matches.recurring.len(),
        matches.new.len(),
        matches.resolved.len()
    );
    if matches.embedding_version_changed {
        println!("  Embedding function changed; similarity to earlier runs was recomputed");
    }
}

async fn health_mode(config: VeritasConfig, json: bool) -> Result<ExitCode> {
    config.validate()?;
    let tools = ToolManager::from_config(&config);
    let report = tools.probe_all(config.execution.probe_timeout_ms).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_empty() {
        println!("No tools configured");
    } else {
        for health in &report {
            println!(
                "{:<24} {:<14} {:>6}ms  {}",
                health.tool_name,
                format!("{:?}", health.status),
                health.duration_ms,
                health.detail
            );
        }
    }

    if !report.is_empty() && report.iter().all(|h| !h.status.is_healthy()) {
        return Ok(EXIT_TOOLS_UNHEALTHY);
    }
    Ok(EXIT_COMPLETE)
}

async fn history_mode(
    config: VeritasConfig,
    command: Command,
    wants_failures: bool,
    json: bool,
) -> Result<ExitCode> {
    let Command::History {
        limit,
        run,
        file,
        min_severity,
        failure_type,
    } = command
    else {
        return Ok(EXIT_INPUT_ERROR);
    };
    let store = open_store(&config).await?;

    if wants_failures {
        let filter = FailureFilter {
            run_id: run.map(veritas_core::RunId),
            file_path: file.map(|f| f.canonicalize().unwrap_or(f)),
            min_severity,
            failure_type,
            limit: Some(limit),
        };
        let failures = tokio::task::spawn_blocking(move || store.list_failures(&filter))
            .await?
            .map_err(|e| Error::Database(format!("{e:#}")))?;

        if json {
            println!("{}", serde_json::to_string_pretty(&failures)?);
        } else {
            for stored in &failures {
                let f = &stored.failure;
                println!(
                    "run {:<5} #{:<6} [{}] {} {}: {}",
                    stored.run_id,
                    stored.record_id,
                    f.severity,
                    f.failure_type,
                    f.context.file_path.display(),
                    f.message
                );
            }
        }
    } else {
        let runs = tokio::task::spawn_blocking(move || store.list_runs(limit))
            .await?
            .map_err(|e| Error::Database(format!("{e:#}")))?;

        if json {
            println!("{}", serde_json::to_string_pretty(&runs)?);
        } else {
            for summary in &runs {
                println!(
                    "run {:<5} {} {:<8} {:>5.1}% ({}/{} files) {} failure(s)",
                    summary.run_id,
                    summary.started_at.format("%Y-%m-%d %H:%M:%S"),
                    summary.analysis_status,
                    summary.coverage_percentage,
                    summary.files_analyzed,
                    summary.files_discovered,
                    summary.failure_count
                );
            }
        }
    }
    Ok(EXIT_COMPLETE)
}

async fn reconcile_mode(mut config: VeritasConfig, json: bool) -> Result<ExitCode> {
    let store = open_store(&config).await?;
    config.memory.reconcile_on_start = false;
    let memory = ErrorMemory::open(&config.memory, store).await?;
    let report = memory.reconcile().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_consistent() {
        println!("Run store and error memory are consistent");
    } else {
        println!(
            "Repaired {} issue(s): {} orphan vector(s), {} dangling link(s), {} missing record(s)",
            report.repaired,
            report.orphan_vectors.len(),
            report.dangling_links.len(),
            report.missing_records.len()
        );
    }
    info!("Reconciliation finished: {} repair(s)", report.repaired);
    Ok(EXIT_COMPLETE)
}

async fn open_store(config: &VeritasConfig) -> Result<RunStore> {
    let path = config.storage.database_path.clone();
    let store = tokio::task::spawn_blocking(move || RunStore::open(&path))
        .await?
        .map_err(|e| Error::Database(format!("{e:#}")))?;
    Ok(store)
}
