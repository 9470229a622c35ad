//! Configuration Management Module
//!
//! Layered configuration: built-in defaults, then an optional TOML file, then
//! `VERITAS__SECTION__KEY` environment variables.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{VeritasError, VeritasResult};
use crate::models::ToolScope;
use crate::taxonomy::UnitKind;

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "veritas.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "VERITAS";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VeritasConfig {
    pub execution: ExecutionSettings,
    pub memory: MemorySettings,
    pub storage: StorageSettings,
    pub discovery: DiscoverySettings,
    pub logging: LoggingSettings,
    pub tools: Vec<ToolSpec>,
}

/// Sandbox and worker pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Per-unit wall-clock budget
    pub default_timeout_ms: u64,
    /// Budget for a tool's health probe
    pub probe_timeout_ms: u64,
    /// Budget for the whole run; unlimited when unset
    pub run_timeout_ms: Option<u64>,
    /// Worker pool size; available cores when unset
    pub pool_size: Option<usize>,
    /// Captured stdout/stderr limit per stream
    pub max_output_bytes: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 180_000,
            probe_timeout_ms: 30_000,
            run_timeout_ms: None,
            pool_size: None,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ExecutionSettings {
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

/// Error memory settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Cosine similarity at or above which an error is recurring
    pub similarity_threshold: f32,
    pub embedding_dimension: usize,
    /// Neighbours inspected per search
    pub search_k: usize,
    pub index_path: PathBuf,
    /// Repair store/index drift before matching
    pub reconcile_on_start: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            embedding_dimension: 256,
            search_k: 5,
            index_path: PathBuf::from(".veritas/error_memory.idx"),
            reconcile_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".veritas/veritas.db"),
        }
    }
}

/// File discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// File extensions to analyse, without the dot
    pub include_extensions: Vec<String>,
    /// Glob patterns excluded from discovery. Empty means nothing is excluded.
    pub exclude: Vec<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            include_extensions: vec!["py".to_string()],
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub json: bool,
    /// Also write daily-rolled log files here
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

/// An external analysis tool.
///
/// `{target}` and `{workspace}` in `args` are replaced with the unit's target
/// path and its scratch directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub kind: UnitKind,
    #[serde(default)]
    pub scope: ToolScope,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_probe_args")]
    pub probe_args: Vec<String>,
    #[serde(default = "default_success_exit_codes")]
    pub success_exit_codes: Vec<i32>,
    /// Overrides `execution.default_timeout_ms`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Only run against files with these extensions; all files when empty
    #[serde(default)]
    pub extensions: Vec<String>,
}

fn default_probe_args() -> Vec<String> {
    vec!["--version".to_string()]
}

fn default_success_exit_codes() -> Vec<i32> {
    vec![0]
}

impl ToolSpec {
    pub fn new(name: &str, kind: UnitKind, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            scope: ToolScope::PerFile,
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            probe_args: default_probe_args(),
            success_exit_codes: default_success_exit_codes(),
            timeout_ms: None,
            extensions: Vec::new(),
        }
    }

    pub fn applies_to(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

impl VeritasConfig {
    /// Load from defaults, `path` (or `veritas.toml` when absent) and environment
    pub fn load(path: Option<&Path>) -> VeritasResult<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: VeritasConfig = settings.try_deserialize()?;
        config.validate()?;

        info!(
            "Loaded configuration with {} tool(s), timeout {}ms",
            config.tools.len(),
            config.execution.default_timeout_ms
        );
        Ok(config)
    }

    /// Load from a TOML string, for embedding and tests
    pub fn from_toml(text: &str) -> VeritasResult<Self> {
        let config: VeritasConfig = toml::from_str(text)
            .map_err(|e| VeritasError::InvalidConfig(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VeritasResult<()> {
        debug!("Validating configuration");

        if self.execution.default_timeout_ms == 0 {
            return Err(VeritasError::InvalidConfig(
                "execution.default_timeout_ms must be positive".to_string(),
            ));
        }
        if self.execution.probe_timeout_ms == 0 {
            return Err(VeritasError::InvalidConfig(
                "execution.probe_timeout_ms must be positive".to_string(),
            ));
        }
        if self.execution.run_timeout_ms == Some(0) {
            return Err(VeritasError::InvalidConfig(
                "execution.run_timeout_ms must be positive when set".to_string(),
            ));
        }
        if self.execution.pool_size == Some(0) {
            return Err(VeritasError::InvalidConfig(
                "execution.pool_size must be positive when set".to_string(),
            ));
        }

        let threshold = self.memory.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(VeritasError::InvalidConfig(format!(
                "memory.similarity_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.memory.embedding_dimension < 16 {
            return Err(VeritasError::InvalidConfig(format!(
                "memory.embedding_dimension must be at least 16, got {}",
                self.memory.embedding_dimension
            )));
        }
        if self.memory.search_k == 0 {
            return Err(VeritasError::InvalidConfig(
                "memory.search_k must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(VeritasError::InvalidConfig(
                    "tool name must not be empty".to_string(),
                ));
            }
            if !names.insert(tool.name.as_str()) {
                return Err(VeritasError::InvalidConfig(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
            if tool.program.trim().is_empty() {
                return Err(VeritasError::InvalidConfig(format!(
                    "tool {} has no program",
                    tool.name
                )));
            }
            if tool.timeout_ms == Some(0) {
                return Err(VeritasError::InvalidConfig(format!(
                    "tool {} has a zero timeout",
                    tool.name
                )));
            }
        }

        Ok(())
    }

    /// Timeout for one unit of `tool`
    pub fn unit_timeout_ms(&self, tool: &ToolSpec) -> u64 {
        tool.timeout_ms.unwrap_or(self.execution.default_timeout_ms)
    }

    /// Unit timeout for a tool by name; the default for unconfigured tools
    pub fn timeout_for_tool(&self, name: &str) -> u64 {
        self.tools
            .iter()
            .find(|t| t.name == name)
            .map(|t| self.unit_timeout_ms(t))
            .unwrap_or(self.execution.default_timeout_ms)
    }
}
