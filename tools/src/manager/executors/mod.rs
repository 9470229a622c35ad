//! Tools Executors Module
//!
//! Process-level execution of external analysis tools.

pub mod subprocess;

pub use subprocess::{ExecutionResult, ExecutorError, SubprocessExecutor};

#[cfg(test)]
mod tests;
