//! Veritas: truthful code analysis
//!
//! Runs external analysis tools over a codebase in isolation, accounts for
//! every file that was or was not analysed, persists each run and
//! remembers recurring failures across runs.

pub mod cli;
pub mod discovery;
pub mod logging;
pub mod orchestrator;

pub use discovery::{Discovered, DiscoveryError, FileDiscovery, GlobDiscovery};
pub use orchestrator::{Orchestrator, RunReport, RunState};
