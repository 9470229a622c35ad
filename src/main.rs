//! Veritas CLI
//!
//! Loads configuration, installs logging and dispatches the subcommand.
//! The process exit code reports how complete the analysis was.

use clap::Parser;

use veritas::cli::{run_cli_mode, Args, EXIT_INPUT_ERROR};
use veritas::logging::init_logging;
use veritas_core::VeritasConfig;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match VeritasConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(EXIT_INPUT_ERROR);
        }
    };

    // Held until exit so the file sink is flushed
    let guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(EXIT_INPUT_ERROR);
        }
    };

    let exit_code = run_cli_mode(args, config).await;
    drop(guard);
    std::process::exit(exit_code);
}
