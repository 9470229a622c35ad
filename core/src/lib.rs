//! Veritas Core Module
//!
//! Shared vocabulary of the analysis engine: the failure taxonomy, the run
//! data model, the coverage accountant and configuration.

pub mod config;
pub mod coverage;
pub mod error;
pub mod models;
pub mod taxonomy;

pub use config::{
    DiscoverySettings, ExecutionSettings, LoggingSettings, MemorySettings, StorageSettings,
    ToolSpec, VeritasConfig,
};
pub use coverage::{
    derive_status, spawn_accountant, Aggregate, CoverageAccountant, CoverageSink, PlannedUnit,
    UnitOutcome,
};
pub use error::{VeritasError, VeritasResult};
pub use models::{
    scope_key, AnalysisRun, AnalysisStatus, CoverageSummary, ExecutionFailure, FailureContext,
    FileUnitResult, HealthStatus, RecordId, RunId, ToolCounters, ToolHealth, ToolScope,
    UnitStatus, VectorId,
};
pub use taxonomy::{
    classify, classify_stderr, Classification, FailureSignal, FailureType, Severity, UnitKind,
};
