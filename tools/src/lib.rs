//! Veritas Tools Module
//!
//! Analysis tool integration: the tool contract, subprocess execution, the
//! per-run health registry and the execution sandbox.

pub mod health;
pub mod manager;
pub mod sandbox;
pub mod tool_models;

pub use health::HealthRegistry;
pub use manager::executors::{ExecutionResult, ExecutorError, SubprocessExecutor};
pub use manager::ToolManager;
pub use sandbox::Sandbox;
pub use tool_models::{AnalysisTool, AnalysisUnit, CommandTool, ToolOutput, ToolRunError};
