//! CLI module
//!
//! Provides:
//! - Argument parsing (`run`, `health`, `history`, `reconcile`)
//! - Subcommand dispatch
//! - Deterministic process exit codes

pub mod args;
pub mod dispatch;

// Re-exports
pub use args::{Args, Command};
pub use dispatch::{exit_code_for_error, exit_code_for_report, run_cli_mode, ExitCode};

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Veritas(#[from] veritas_core::VeritasError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Error memory error: {0}")]
    Memory(#[from] veritas_memory::MemoryError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Exit codes (deterministic)
pub const EXIT_COMPLETE: i32 = 0;
/// Analysis finished with findings or incomplete coverage
pub const EXIT_PARTIAL: i32 = 1;
/// Run failed or a critical setup step failed
pub const EXIT_FAILED: i32 = 2;
pub const EXIT_RUN_TIMEOUT: i32 = 3;
/// Bad root path or configuration
pub const EXIT_INPUT_ERROR: i32 = 4;
/// Every configured tool failed its health check
pub const EXIT_TOOLS_UNHEALTHY: i32 = 5;
/// Coverage is incomplete because tools failed to execute
pub const EXIT_TOOL_FAILURE: i32 = 6;

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, Error>;
