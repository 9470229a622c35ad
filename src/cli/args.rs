//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use veritas_core::{FailureType, Severity};

/// Truthful code analysis: runs analysis tools in isolation and reports
/// exactly how much of the codebase was actually analysed
#[derive(Parser, Debug, Clone)]
#[command(name = "veritas", version, about)]
pub struct Args {
    /// Configuration file (defaults to ./veritas.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of a summary
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Analyse one or more root paths
    Run {
        /// Files or directories to analyse
        #[arg(required = true)]
        roots: Vec<PathBuf>,

        /// Budget for the whole run, in milliseconds
        #[arg(long)]
        run_timeout_ms: Option<u64>,

        /// Number of units executed concurrently
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Probe every configured tool and print its health
    Health,

    /// Show recent runs, or stored failures when a filter is given
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Only failures of this run
        #[arg(long)]
        run: Option<i64>,

        /// Only failures in this file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Only failures at or above this severity (INFO, WARNING, ERROR, CRITICAL)
        #[arg(long)]
        min_severity: Option<Severity>,

        /// Only failures of this type, e.g. IMPORT_ERROR
        #[arg(long)]
        failure_type: Option<FailureType>,
    },

    /// Check the run store against the error memory and repair drift
    Reconcile,
}

impl Command {
    /// Whether `history` should list failures rather than runs
    pub fn wants_failures(&self) -> bool {
        matches!(
            self,
            Command::History { run, file, min_severity, failure_type, .. }
                if run.is_some() || file.is_some() || min_severity.is_some() || failure_type.is_some()
        )
    }
}
