//! Veritas errors
//!
//! Setup-level errors only. Anything that goes wrong inside an analysis unit
//! is reported as an [`crate::ExecutionFailure`] value instead.

use std::io;
use std::path::PathBuf;

/// Veritas errors
#[derive(Debug, thiserror::Error)]
pub enum VeritasError {
    #[error("Root path does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("No root paths given")]
    NoRoots,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Run was cancelled before it could complete")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type VeritasResult<T> = Result<T, VeritasError>;
