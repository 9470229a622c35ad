//! Failure Taxonomy
//!
//! Deterministic classification of everything that can go wrong while running
//! an analysis unit. A [`FailureSignal`] describes what was observed (a timeout,
//! a spawn error, a non-zero exit with some stderr, ...) and [`classify`] walks
//! an ordered rule table and returns the first match.
//!
//! Rule order (first match wins):
//!
//! | # | rule                 | type              | severity |
//! |---|----------------------|-------------------|----------|
//! | 1 | `timeout`            | TIMEOUT           | ERROR    |
//! | 2 | `cancelled`          | TIMEOUT           | WARNING  |
//! | 3 | `tool_not_installed` | TOOL_ERROR        | CRITICAL |
//! | 4 | `spawn_permission`   | PERMISSION_ERROR  | CRITICAL |
//! | 5 | `spawn_failed`       | TOOL_ERROR        | CRITICAL |
//! | 6 | `probe_failed`       | TOOL_ERROR        | CRITICAL |
//! | 7 | `tool_panicked`      | TOOL_ERROR        | CRITICAL |
//! | 8 | `tool_io`            | TOOL_ERROR        | ERROR    |
//! | 9 | `file_access`        | FILE_ACCESS_ERROR | ERROR    |
//! |10 | `workspace`          | TOOL_ERROR        | ERROR    |
//! |11 | `circular_import`    | CIRCULAR_IMPORT   | ERROR    |
//! |12 | `module_not_found`   | IMPORT_ERROR      | ERROR    |
//! |13 | `import_error`       | IMPORT_ERROR      | ERROR    |
//! |14 | `syntax_error`       | SYNTAX_ERROR      | ERROR    |
//! |15 | `dependency_error`   | DEPENDENCY_ERROR  | ERROR    |
//! |16 | `target_permission`  | PERMISSION_ERROR  | ERROR    |
//! |17 | `output_parsing`     | PARSING_ERROR     | WARNING  |
//! |18 | `runtime_exception`  | RUNTIME_ERROR     | ERROR    |
//! |19 | `tool_exit`          | TOOL_ERROR        | ERROR    |
//!
//! Rules 11-18 inspect stderr line by line; the matched line becomes the
//! failure message so identical conditions produce identical messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::VeritasError;

/// Maximum length of a classified message, in characters
const MAX_MESSAGE_CHARS: usize = 500;

/// Failure type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    FileAccessError,
    ToolError,
    ParsingError,
    ImportError,
    SyntaxError,
    RuntimeError,
    DependencyError,
    CircularImport,
    Timeout,
    PermissionError,
}

impl FailureType {
    pub const ALL: [FailureType; 10] = [
        FailureType::FileAccessError,
        FailureType::ToolError,
        FailureType::ParsingError,
        FailureType::ImportError,
        FailureType::SyntaxError,
        FailureType::RuntimeError,
        FailureType::DependencyError,
        FailureType::CircularImport,
        FailureType::Timeout,
        FailureType::PermissionError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::FileAccessError => "FILE_ACCESS_ERROR",
            FailureType::ToolError => "TOOL_ERROR",
            FailureType::ParsingError => "PARSING_ERROR",
            FailureType::ImportError => "IMPORT_ERROR",
            FailureType::SyntaxError => "SYNTAX_ERROR",
            FailureType::RuntimeError => "RUNTIME_ERROR",
            FailureType::DependencyError => "DEPENDENCY_ERROR",
            FailureType::CircularImport => "CIRCULAR_IMPORT",
            FailureType::Timeout => "TIMEOUT",
            FailureType::PermissionError => "PERMISSION_ERROR",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureType {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| VeritasError::UnknownVariant {
                kind: "failure type",
                value: s.to_string(),
            })
    }
}

/// Failure severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Numeric rank used for range queries in the store
    pub fn rank(&self) -> i64 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Error => 2,
            Severity::Critical => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "WARNING" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(VeritasError::UnknownVariant {
                kind: "severity",
                value: s.to_string(),
            }),
        }
    }
}

/// What kind of analysis a unit performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Reads the target without running it
    StaticScan,
    /// Runs the target under a profiler
    RuntimeProfile,
    /// Runs the target under a tracer
    Trace,
}

impl UnitKind {
    /// Whether the unit executes the analysed code
    pub fn executes_target(&self) -> bool {
        matches!(self, UnitKind::RuntimeProfile | UnitKind::Trace)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::StaticScan => "static_scan",
            UnitKind::RuntimeProfile => "runtime_profile",
            UnitKind::Trace => "trace",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitKind {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static_scan" => Ok(UnitKind::StaticScan),
            "runtime_profile" => Ok(UnitKind::RuntimeProfile),
            "trace" => Ok(UnitKind::Trace),
            _ => Err(VeritasError::UnknownVariant {
                kind: "unit kind",
                value: s.to_string(),
            }),
        }
    }
}

/// What was observed when a unit went wrong
#[derive(Debug, Clone, Copy)]
pub enum FailureSignal<'a> {
    /// The unit exceeded its wall-clock budget and was killed
    TimedOut { timeout_ms: u64 },
    /// A run-level cancellation stopped the unit
    Cancelled,
    /// The tool process could not be started
    SpawnFailed {
        kind: io::ErrorKind,
        program: &'a str,
        detail: &'a str,
    },
    /// The tool's health probe failed earlier in this run
    ProbeFailed { tool: &'a str, detail: &'a str },
    /// The task driving the unit panicked
    Panicked { detail: &'a str },
    /// Output of a started tool could not be collected
    ToolIo { detail: &'a str },
    /// The target file could not be read
    FileAccess { detail: &'a str },
    /// The scratch workspace could not be prepared
    Workspace { detail: &'a str },
    /// The tool ran and exited; `code` is `None` when killed by a signal
    Exited { code: Option<i32>, stderr: &'a str },
}

/// When a rule's failure counts as a property of the analysed code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finding {
    Never,
    /// Only when the unit was executing the target
    WhenExecuting,
    Always,
}

/// Result of classifying a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub failure_type: FailureType,
    pub severity: Severity,
    pub message: String,
    pub is_analysis_finding: bool,
    /// Name of the rule that matched
    pub rule: &'static str,
}

struct Rule {
    name: &'static str,
    matches: fn(&FailureSignal<'_>) -> Option<String>,
    failure_type: FailureType,
    severity: Severity,
    finding: Finding,
}

static RULES: &[Rule] = &[
    Rule {
        name: "timeout",
        matches: timed_out,
        failure_type: FailureType::Timeout,
        severity: Severity::Error,
        finding: Finding::Never,
    },
    Rule {
        name: "cancelled",
        matches: cancelled,
        failure_type: FailureType::Timeout,
        severity: Severity::Warning,
        finding: Finding::Never,
    },
    Rule {
        name: "tool_not_installed",
        matches: tool_not_installed,
        failure_type: FailureType::ToolError,
        severity: Severity::Critical,
        finding: Finding::Never,
    },
    Rule {
        name: "spawn_permission",
        matches: spawn_permission,
        failure_type: FailureType::PermissionError,
        severity: Severity::Critical,
        finding: Finding::Never,
    },
    Rule {
        name: "spawn_failed",
        matches: spawn_failed,
        failure_type: FailureType::ToolError,
        severity: Severity::Critical,
        finding: Finding::Never,
    },
    Rule {
        name: "probe_failed",
        matches: probe_failed,
        failure_type: FailureType::ToolError,
        severity: Severity::Critical,
        finding: Finding::Never,
    },
    Rule {
        name: "tool_panicked",
        matches: panicked,
        failure_type: FailureType::ToolError,
        severity: Severity::Critical,
        finding: Finding::Never,
    },
    Rule {
        name: "tool_io",
        matches: tool_io,
        failure_type: FailureType::ToolError,
        severity: Severity::Error,
        finding: Finding::Never,
    },
    Rule {
        name: "file_access",
        matches: file_access,
        failure_type: FailureType::FileAccessError,
        severity: Severity::Error,
        finding: Finding::Never,
    },
    Rule {
        name: "workspace",
        matches: workspace,
        failure_type: FailureType::ToolError,
        severity: Severity::Error,
        finding: Finding::Never,
    },
    Rule {
        name: "circular_import",
        matches: circular_import,
        failure_type: FailureType::CircularImport,
        severity: Severity::Error,
        finding: Finding::WhenExecuting,
    },
    Rule {
        name: "module_not_found",
        matches: module_not_found,
        failure_type: FailureType::ImportError,
        severity: Severity::Error,
        finding: Finding::WhenExecuting,
    },
    Rule {
        name: "import_error",
        matches: import_error,
        failure_type: FailureType::ImportError,
        severity: Severity::Error,
        finding: Finding::WhenExecuting,
    },
    Rule {
        name: "syntax_error",
        matches: syntax_error,
        failure_type: FailureType::SyntaxError,
        severity: Severity::Error,
        finding: Finding::Always,
    },
    Rule {
        name: "dependency_error",
        matches: dependency_error,
        failure_type: FailureType::DependencyError,
        severity: Severity::Error,
        finding: Finding::WhenExecuting,
    },
    Rule {
        name: "target_permission",
        matches: target_permission,
        failure_type: FailureType::PermissionError,
        severity: Severity::Error,
        finding: Finding::Never,
    },
    Rule {
        name: "output_parsing",
        matches: output_parsing,
        failure_type: FailureType::ParsingError,
        severity: Severity::Warning,
        finding: Finding::Never,
    },
    Rule {
        name: "runtime_exception",
        matches: runtime_exception,
        failure_type: FailureType::RuntimeError,
        severity: Severity::Error,
        finding: Finding::WhenExecuting,
    },
    Rule {
        name: "tool_exit",
        matches: tool_exit,
        failure_type: FailureType::ToolError,
        severity: Severity::Error,
        finding: Finding::Never,
    },
];

/// Names of the classification rules in evaluation order
pub fn rule_names() -> Vec<&'static str> {
    RULES.iter().map(|r| r.name).collect()
}

/// Classify a failure signal observed while running a unit of `kind`.
///
/// Every signal classifies: the final `tool_exit` rule accepts any exit.
pub fn classify(signal: &FailureSignal<'_>, kind: UnitKind) -> Classification {
    for rule in RULES {
        if let Some(message) = (rule.matches)(signal) {
            return build(rule, message, kind);
        }
    }

    // Only reachable for a successful exit with clean stderr, which callers
    // do not classify. Report it as a tool error rather than dropping it.
    Classification {
        failure_type: FailureType::ToolError,
        severity: Severity::Error,
        message: "Tool reported failure without diagnostics".to_string(),
        is_analysis_finding: false,
        rule: "tool_exit",
    }
}

/// Inspect stderr of a unit that exited successfully.
///
/// Tools that execute the target often exit 0 even when the target raised;
/// only code-property rules are consulted here.
pub fn classify_stderr(stderr: &str, kind: UnitKind) -> Option<Classification> {
    let signal = FailureSignal::Exited {
        code: Some(0),
        stderr,
    };
    RULES
        .iter()
        .find_map(|rule| (rule.matches)(&signal).map(|message| build(rule, message, kind)))
        .filter(|c| c.is_analysis_finding)
}

fn build(rule: &Rule, message: String, kind: UnitKind) -> Classification {
    let is_analysis_finding = match rule.finding {
        Finding::Never => false,
        Finding::WhenExecuting => kind.executes_target(),
        Finding::Always => true,
    };

    Classification {
        failure_type: rule.failure_type,
        severity: rule.severity,
        message: clip(&message),
        is_analysis_finding,
        rule: rule.name,
    }
}

fn clip(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= MAX_MESSAGE_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().take(MAX_MESSAGE_CHARS).collect()
    }
}

fn timed_out(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::TimedOut { timeout_ms } => {
            Some(format!("Unit exceeded timeout of {timeout_ms}ms"))
        }
        _ => None,
    }
}

fn cancelled(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::Cancelled => Some("Unit cancelled before completion".to_string()),
        _ => None,
    }
}

fn tool_not_installed(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::SpawnFailed {
            kind: io::ErrorKind::NotFound,
            program,
            ..
        } => Some(format!("Tool executable not found: {program}")),
        _ => None,
    }
}

fn spawn_permission(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::SpawnFailed {
            kind: io::ErrorKind::PermissionDenied,
            program,
            ..
        } => Some(format!("Permission denied starting tool: {program}")),
        _ => None,
    }
}

fn spawn_failed(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::SpawnFailed {
            program, detail, ..
        } => Some(format!("Failed to start tool {program}: {detail}")),
        _ => None,
    }
}

fn probe_failed(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::ProbeFailed { tool, detail } => {
            Some(format!("Health probe failed for {tool}: {detail}"))
        }
        _ => None,
    }
}

fn panicked(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::Panicked { detail } => Some(format!("Analysis unit panicked: {detail}")),
        _ => None,
    }
}

fn tool_io(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::ToolIo { detail } => Some(format!("Lost contact with tool: {detail}")),
        _ => None,
    }
}

fn file_access(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::FileAccess { detail } => Some(format!("Cannot read target: {detail}")),
        _ => None,
    }
}

fn workspace(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::Workspace { detail } => {
            Some(format!("Failed to prepare unit workspace: {detail}"))
        }
        _ => None,
    }
}

fn stderr_of<'a>(signal: &FailureSignal<'a>) -> Option<&'a str> {
    match signal {
        FailureSignal::Exited { stderr, .. } => Some(stderr),
        _ => None,
    }
}

/// Last stderr line satisfying `pred`; the final exception line of a
/// traceback is the one that names the error.
fn last_line(stderr: &str, pred: impl Fn(&str) -> bool) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| pred(line))
        .last()
        .map(str::to_string)
}

fn circular_import(signal: &FailureSignal<'_>) -> Option<String> {
    let stderr = stderr_of(signal)?;
    last_line(stderr, |line| {
        line.contains("partially initialized module") || line.contains("circular import")
    })
}

fn module_not_found(signal: &FailureSignal<'_>) -> Option<String> {
    let stderr = stderr_of(signal)?;
    last_line(stderr, |line| {
        line.starts_with("ModuleNotFoundError") || line.contains("No module named")
    })
}

fn import_error(signal: &FailureSignal<'_>) -> Option<String> {
    let stderr = stderr_of(signal)?;
    last_line(stderr, |line| line.starts_with("ImportError"))
}

fn syntax_error(signal: &FailureSignal<'_>) -> Option<String> {
    let stderr = stderr_of(signal)?;
    last_line(stderr, |line| {
        line.starts_with("SyntaxError")
            || line.starts_with("IndentationError")
            || line.starts_with("TabError")
    })
}

fn dependency_error(signal: &FailureSignal<'_>) -> Option<String> {
    let stderr = stderr_of(signal)?;
    last_line(stderr, |line| {
        line.contains("DistributionNotFound") || line.contains("VersionConflict")
    })
}

fn target_permission(signal: &FailureSignal<'_>) -> Option<String> {
    let stderr = stderr_of(signal)?;
    last_line(stderr, |line| {
        line.starts_with("PermissionError") || line.contains("Permission denied")
    })
}

fn output_parsing(signal: &FailureSignal<'_>) -> Option<String> {
    let stderr = stderr_of(signal)?;
    last_line(stderr, |line| {
        line.starts_with("JSONDecodeError")
            || line.starts_with("json.decoder.JSONDecodeError")
            || line.starts_with("UnicodeDecodeError")
            || line.contains("failed to parse output")
    })
}

fn exception_line() -> Option<&'static Regex> {
    static EXCEPTION: OnceLock<Option<Regex>> = OnceLock::new();
    EXCEPTION
        .get_or_init(|| {
            Regex::new(
                r"^(?:[A-Za-z_][\w.]*\.)?[A-Z]\w*(?:Error|Exception|Interrupt|Exit)\b(?::.*)?$",
            )
            .ok()
        })
        .as_ref()
}

fn runtime_exception(signal: &FailureSignal<'_>) -> Option<String> {
    let stderr = stderr_of(signal)?;
    let exception = exception_line()?;
    if let Some(line) = last_line(stderr, |line| exception.is_match(line)) {
        return Some(line);
    }
    if stderr.contains("Traceback (most recent call last)") {
        return Some("Unhandled exception in analysed code".to_string());
    }
    None
}

fn tool_exit(signal: &FailureSignal<'_>) -> Option<String> {
    match signal {
        FailureSignal::Exited {
            code: Some(code), ..
        } if *code != 0 => Some(format!("Tool exited with status {code}")),
        FailureSignal::Exited { code: None, .. } => {
            Some("Tool terminated by signal".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(stderr: &str) -> FailureSignal<'_> {
        FailureSignal::Exited {
            code: Some(1),
            stderr,
        }
    }

    #[test]
    fn test_timeout_rule() {
        let c = classify(&FailureSignal::TimedOut { timeout_ms: 180_000 }, UnitKind::Trace);
        assert_eq!(c.failure_type, FailureType::Timeout);
        assert_eq!(c.severity, Severity::Error);
        assert_eq!(c.message, "Unit exceeded timeout of 180000ms");
        assert!(!c.is_analysis_finding);
    }

    #[test]
    fn test_cancelled_rule() {
        let c = classify(&FailureSignal::Cancelled, UnitKind::StaticScan);
        assert_eq!(c.failure_type, FailureType::Timeout);
        assert_eq!(c.severity, Severity::Warning);
        assert_eq!(c.rule, "cancelled");
    }

    #[test]
    fn test_tool_not_installed_rule() {
        let c = classify(
            &FailureSignal::SpawnFailed {
                kind: io::ErrorKind::NotFound,
                program: "scalene",
                detail: "No such file or directory (os error 2)",
            },
            UnitKind::RuntimeProfile,
        );
        assert_eq!(c.failure_type, FailureType::ToolError);
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.message, "Tool executable not found: scalene");
        assert!(!c.is_analysis_finding);
    }

    #[test]
    fn test_spawn_permission_rule() {
        let c = classify(
            &FailureSignal::SpawnFailed {
                kind: io::ErrorKind::PermissionDenied,
                program: "/opt/tool",
                detail: "denied",
            },
            UnitKind::StaticScan,
        );
        assert_eq!(c.failure_type, FailureType::PermissionError);
        assert!(!c.is_analysis_finding);
    }

    #[test]
    fn test_other_spawn_failure_rule() {
        let c = classify(
            &FailureSignal::SpawnFailed {
                kind: io::ErrorKind::Other,
                program: "tool",
                detail: "exec format error",
            },
            UnitKind::StaticScan,
        );
        assert_eq!(c.rule, "spawn_failed");
        assert_eq!(c.failure_type, FailureType::ToolError);
    }

    #[test]
    fn test_probe_and_panic_rules() {
        let probe = classify(
            &FailureSignal::ProbeFailed {
                tool: "viztracer",
                detail: "exit status 127",
            },
            UnitKind::Trace,
        );
        assert_eq!(probe.rule, "probe_failed");
        assert_eq!(probe.severity, Severity::Critical);

        let panic = classify(&FailureSignal::Panicked { detail: "boom" }, UnitKind::Trace);
        assert_eq!(panic.rule, "tool_panicked");
        assert!(!panic.is_analysis_finding);
    }

    #[test]
    fn test_file_access_and_workspace_rules() {
        let file = classify(
            &FailureSignal::FileAccess { detail: "gone" },
            UnitKind::StaticScan,
        );
        assert_eq!(file.failure_type, FailureType::FileAccessError);

        let ws = classify(
            &FailureSignal::Workspace { detail: "disk full" },
            UnitKind::StaticScan,
        );
        assert_eq!(ws.rule, "workspace");
        assert_eq!(ws.failure_type, FailureType::ToolError);
    }

    #[test]
    fn test_circular_import_precedes_import_error() {
        let stderr = "Traceback (most recent call last):\n  File \"a.py\", line 1, in <module>\nImportError: cannot import name 'b' from partially initialized module 'b' (most likely due to a circular import)";
        let c = classify(&exited(stderr), UnitKind::RuntimeProfile);
        assert_eq!(c.failure_type, FailureType::CircularImport);
        assert!(c.is_analysis_finding);
    }

    #[test]
    fn test_module_not_found_rule() {
        let stderr = "Traceback (most recent call last):\n  File \"/tmp/x/app.py\", line 1, in <module>\n    import non_existent_module\nModuleNotFoundError: No module named 'non_existent_module'\n";
        let c = classify(&exited(stderr), UnitKind::RuntimeProfile);
        assert_eq!(c.failure_type, FailureType::ImportError);
        assert_eq!(c.severity, Severity::Error);
        assert_eq!(
            c.message,
            "ModuleNotFoundError: No module named 'non_existent_module'"
        );
        assert!(c.is_analysis_finding);
    }

    #[test]
    fn test_import_error_rule() {
        let c = classify(
            &exited("ImportError: cannot import name 'x' from 'y'"),
            UnitKind::Trace,
        );
        assert_eq!(c.rule, "import_error");
    }

    #[test]
    fn test_import_error_from_static_scan_is_not_a_finding() {
        let c = classify(
            &exited("ModuleNotFoundError: No module named 'pylint_plugins'"),
            UnitKind::StaticScan,
        );
        assert_eq!(c.failure_type, FailureType::ImportError);
        assert!(!c.is_analysis_finding);
    }

    #[test]
    fn test_syntax_error_rule_is_always_a_finding() {
        for stderr in [
            "SyntaxError: invalid syntax",
            "IndentationError: unexpected indent",
            "TabError: inconsistent use of tabs",
        ] {
            let c = classify(&exited(stderr), UnitKind::StaticScan);
            assert_eq!(c.failure_type, FailureType::SyntaxError, "{stderr}");
            assert!(c.is_analysis_finding);
        }
    }

    #[test]
    fn test_dependency_error_rule() {
        let c = classify(
            &exited("pkg_resources.DistributionNotFound: The 'requests>=2' distribution was not found"),
            UnitKind::RuntimeProfile,
        );
        assert_eq!(c.failure_type, FailureType::DependencyError);
        assert!(c.is_analysis_finding);
    }

    #[test]
    fn test_target_permission_rule() {
        let c = classify(
            &exited("PermissionError: [Errno 13] Permission denied: '/etc/shadow'"),
            UnitKind::RuntimeProfile,
        );
        assert_eq!(c.failure_type, FailureType::PermissionError);
        assert!(!c.is_analysis_finding);
    }

    #[test]
    fn test_output_parsing_rule() {
        let c = classify(
            &exited("json.decoder.JSONDecodeError: Expecting value: line 1 column 1"),
            UnitKind::StaticScan,
        );
        assert_eq!(c.failure_type, FailureType::ParsingError);
        assert_eq!(c.severity, Severity::Warning);
    }

    #[test]
    fn test_runtime_exception_rule_uses_final_exception_line() {
        let stderr = "Traceback (most recent call last):\n  File \"m.py\", line 3, in <module>\n    main()\nZeroDivisionError: division by zero";
        let c = classify(&exited(stderr), UnitKind::RuntimeProfile);
        assert_eq!(c.failure_type, FailureType::RuntimeError);
        assert_eq!(c.message, "ZeroDivisionError: division by zero");
        assert!(c.is_analysis_finding);
    }

    #[test]
    fn test_bare_traceback_is_runtime_error() {
        let c = classify(
            &exited("Traceback (most recent call last):\n  File \"m.py\", line 3"),
            UnitKind::Trace,
        );
        assert_eq!(c.failure_type, FailureType::RuntimeError);
        assert_eq!(c.message, "Unhandled exception in analysed code");
    }

    #[test]
    fn test_fallback_tool_exit_rule() {
        let c = classify(
            &FailureSignal::Exited {
                code: Some(2),
                stderr: "usage: tool [-h]",
            },
            UnitKind::StaticScan,
        );
        assert_eq!(c.rule, "tool_exit");
        assert_eq!(c.message, "Tool exited with status 2");

        let killed = classify(
            &FailureSignal::Exited {
                code: None,
                stderr: "",
            },
            UnitKind::StaticScan,
        );
        assert_eq!(killed.message, "Tool terminated by signal");
    }

    #[test]
    fn test_classification_is_deterministic() {
        let stderr = "ModuleNotFoundError: No module named 'x'";
        let a = classify(&exited(stderr), UnitKind::Trace);
        let b = classify(&exited(stderr), UnitKind::Trace);
        assert_eq!(a, b);
    }

    #[test]
    fn test_classify_stderr_on_success_only_reports_findings() {
        assert!(classify_stderr("warning: slow import", UnitKind::Trace).is_none());
        assert!(
            classify_stderr("PermissionError: denied", UnitKind::RuntimeProfile).is_none()
        );
        let c = classify_stderr(
            "ModuleNotFoundError: No module named 'x'",
            UnitKind::RuntimeProfile,
        )
        .unwrap();
        assert_eq!(c.failure_type, FailureType::ImportError);
        // a static scanner's own import trouble is not about the target
        assert!(
            classify_stderr("ModuleNotFoundError: No module named 'x'", UnitKind::StaticScan)
                .is_none()
        );
    }

    #[test]
    fn test_rule_order_is_fixed() {
        let names = rule_names();
        assert_eq!(names.first(), Some(&"timeout"));
        assert_eq!(names.last(), Some(&"tool_exit"));
        assert_eq!(names.len(), 19);
    }

    #[test]
    fn test_failure_type_round_trips_through_str() {
        for t in FailureType::ALL {
            assert_eq!(t.as_str().parse::<FailureType>().unwrap(), t);
        }
        assert!("NOPE".parse::<FailureType>().is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
