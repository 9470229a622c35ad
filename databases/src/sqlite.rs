//! SQLite run store
//!
//! Persists analysis runs, their unit results and failures, and the links
//! between failure records and vectors in the error memory. Every run is
//! committed in a single transaction: readers see all of it or none of it.
//!
//! Methods are synchronous; async callers go through
//! `tokio::task::spawn_blocking`.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use veritas_core::{
    AnalysisRun, AnalysisStatus, ExecutionFailure, FailureContext, FailureType, FileUnitResult,
    RecordId, RunId, Severity, VectorId,
};

use crate::vector_index::FingerprintFields;

/// Current on-disk schema version
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS analysis_runs (
        run_id INTEGER PRIMARY KEY AUTOINCREMENT,
        invocation_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        root_paths TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        files_discovered INTEGER NOT NULL,
        files_analyzed INTEGER NOT NULL,
        files_skipped INTEGER NOT NULL,
        analysis_status TEXT NOT NULL,
        coverage_percentage REAL NOT NULL,
        completeness_context TEXT NOT NULL,
        tool_health TEXT NOT NULL,
        tool_counters TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS failures (
        record_id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL REFERENCES analysis_runs(run_id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        failure_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        severity_rank INTEGER NOT NULL,
        message TEXT NOT NULL,
        file_path TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        unit_kind TEXT NOT NULL,
        raw_error TEXT,
        is_analysis_finding INTEGER NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS unit_results (
        run_id INTEGER NOT NULL REFERENCES analysis_runs(run_id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        file_path TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        unit_kind TEXT NOT NULL,
        scope TEXT NOT NULL,
        status TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        exit_code INTEGER,
        output TEXT,
        failure_record_id INTEGER REFERENCES failures(record_id),
        PRIMARY KEY (run_id, seq)
    );

    CREATE TABLE IF NOT EXISTS vector_links (
        vector_id INTEGER PRIMARY KEY,
        record_id INTEGER NOT NULL UNIQUE REFERENCES failures(record_id),
        scope TEXT NOT NULL,
        failure_type TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        first_seen_run INTEGER NOT NULL,
        last_seen_run INTEGER NOT NULL,
        last_seen_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_failures_run ON failures(run_id, seq);
    CREATE INDEX IF NOT EXISTS idx_failures_file ON failures(file_path);
    CREATE INDEX IF NOT EXISTS idx_failures_type ON failures(failure_type);
    CREATE INDEX IF NOT EXISTS idx_vector_links_scope ON vector_links(scope, failure_type);
";

/// Identifiers assigned when a run is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRun {
    pub run_id: RunId,
    /// One per entry of `AnalysisRun::failures`, same order
    pub record_ids: Vec<RecordId>,
}

/// A failure together with its storage identifiers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFailure {
    pub record_id: RecordId,
    pub run_id: RunId,
    pub failure: ExecutionFailure,
}

/// Conjunctive filter over stored failures
#[derive(Debug, Clone, Default)]
pub struct FailureFilter {
    pub run_id: Option<RunId>,
    pub file_path: Option<PathBuf>,
    pub min_severity: Option<Severity>,
    pub failure_type: Option<FailureType>,
    pub limit: Option<usize>,
}

/// One row of run history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub invocation_id: Uuid,
    pub root_paths: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub analysis_status: AnalysisStatus,
    pub coverage_percentage: f64,
    pub files_discovered: u64,
    pub files_analyzed: u64,
    pub failure_count: u64,
}

/// Association between a remembered vector and the failure record that
/// created it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorLink {
    pub vector_id: VectorId,
    pub record_id: RecordId,
    pub scope: String,
    pub fingerprint: FingerprintFields,
    pub first_seen_run: RunId,
    pub last_seen_run: RunId,
    pub last_seen_at: DateTime<Utc>,
}

/// Link mutations committed together
#[derive(Debug, Clone, Default)]
pub struct LinkChanges {
    pub insert: Vec<VectorLink>,
    pub touch: Vec<(VectorId, RunId, DateTime<Utc>)>,
    pub delete: Vec<VectorId>,
}

impl LinkChanges {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.touch.is_empty() && self.delete.is_empty()
    }
}

/// Row counts, for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub runs: u64,
    pub failures: u64,
    pub vector_links: u64,
}

/// SQLite-backed relational store
#[derive(Clone)]
pub struct RunStore {
    connection: Arc<Mutex<Connection>>,
}

impl RunStore {
    /// Open (or create) the database file and bring the schema up to date
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening run store at {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create database directory {}: {e}", parent.display())
            })?;
        }

        let connection = Connection::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open SQLite database: {e}"))?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()
            .map_err(|e| anyhow::anyhow!("Failed to open in-memory database: {e}"))?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| anyhow::anyhow!("Failed to enable foreign keys: {e}"))?;
        connection
            .busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| anyhow::anyhow!("Failed to set busy timeout: {e}"))?;

        let store = Self {
            connection: Arc::new(Mutex::new(connection)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire connection lock: {e}"))
    }

    /// Create tables and record the schema version; refuses databases
    /// written by a newer release
    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| anyhow::anyhow!("Failed to create schema: {e}"))?;

        let current: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version;", [], |row| row.get(0))
            .map_err(|e| anyhow::anyhow!("Failed to read schema version: {e}"))?;

        match current {
            Some(version) if version > SCHEMA_VERSION => {
                anyhow::bail!(
                    "Database schema version {version} is newer than supported version {SCHEMA_VERSION}"
                );
            }
            Some(version) if version == SCHEMA_VERSION => {}
            _ => {
                conn.execute(
                    "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2);",
                    params![SCHEMA_VERSION, timestamp(&Utc::now())],
                )
                .map_err(|e| anyhow::anyhow!("Failed to record schema version: {e}"))?;
                info!("Run store schema initialized at version {SCHEMA_VERSION}");
            }
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.lock()?;
        let version: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version;", [], |row| row.get(0))
            .map_err(|e| anyhow::anyhow!("Failed to read schema version: {e}"))?;
        Ok(version.unwrap_or(0))
    }

    /// Commit a run with all its unit results and failures atomically
    pub fn persist_run(&self, run: &AnalysisRun) -> Result<PersistedRun> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| anyhow::anyhow!("Failed to begin transaction: {e}"))?;

        let root_paths = serde_json::to_string(&run.root_paths)
            .map_err(|e| anyhow::anyhow!("Failed to serialize root paths: {e}"))?;
        let tool_health = serde_json::to_string(&run.tool_health)
            .map_err(|e| anyhow::anyhow!("Failed to serialize tool health: {e}"))?;
        let tool_counters = serde_json::to_string(&run.tool_counters)
            .map_err(|e| anyhow::anyhow!("Failed to serialize tool counters: {e}"))?;

        tx.execute(
            "INSERT INTO analysis_runs (invocation_id, scope, root_paths, started_at, finished_at,
                 files_discovered, files_analyzed, files_skipped, analysis_status,
                 coverage_percentage, completeness_context, tool_health, tool_counters)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);",
            params![
                run.invocation_id.to_string(),
                run.scope_key(),
                root_paths,
                timestamp(&run.started_at),
                run.finished_at.as_ref().map(timestamp),
                run.files_discovered as i64,
                run.files_analyzed as i64,
                run.files_skipped as i64,
                run.analysis_status.as_str(),
                run.coverage_percentage,
                run.completeness_context,
                tool_health,
                tool_counters,
            ],
        )
        .map_err(|e| anyhow::anyhow!("Failed to insert analysis run: {e}"))?;
        let run_id = RunId(tx.last_insert_rowid());

        let mut record_ids = Vec::with_capacity(run.failures.len());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO failures (run_id, seq, failure_type, severity, severity_rank,
                         message, file_path, tool_name, unit_kind, raw_error,
                         is_analysis_finding, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
                )
                .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {e}"))?;

            for (seq, failure) in run.failures.iter().enumerate() {
                stmt.execute(params![
                    run_id.0,
                    seq as i64,
                    failure.failure_type.as_str(),
                    failure.severity.as_str(),
                    failure.severity.rank(),
                    failure.message,
                    failure.context.file_path.to_string_lossy().into_owned(),
                    failure.context.tool_name,
                    failure.context.unit_kind.as_str(),
                    failure.raw_error,
                    failure.is_analysis_finding,
                    timestamp(&failure.timestamp),
                ])
                .map_err(|e| anyhow::anyhow!("Failed to insert failure: {e}"))?;
                record_ids.push(RecordId(tx.last_insert_rowid()));
            }
        }

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO unit_results (run_id, seq, file_path, tool_name, unit_kind, scope,
                         status, duration_ms, exit_code, output, failure_record_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
                )
                .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {e}"))?;

            // Unit failures appear in `run.failures` in unit order
            let mut cursor = 0;
            for (seq, unit) in run.unit_results.iter().enumerate() {
                let failure_record_id = unit.failure.as_ref().and_then(|failure| {
                    let offset = run.failures[cursor..].iter().position(|f| f == failure)?;
                    let index = cursor + offset;
                    cursor = index + 1;
                    Some(record_ids[index].0)
                });

                stmt.execute(params![
                    run_id.0,
                    seq as i64,
                    unit.file_path.to_string_lossy().into_owned(),
                    unit.tool_name,
                    unit.unit_kind.as_str(),
                    unit.scope.as_str(),
                    unit.status.as_str(),
                    unit.duration_ms as i64,
                    unit.exit_code,
                    unit.output,
                    failure_record_id,
                ])
                .map_err(|e| anyhow::anyhow!("Failed to insert unit result: {e}"))?;
            }
        }

        tx.commit()
            .map_err(|e| anyhow::anyhow!("Failed to commit run {run_id}: {e}"))?;

        info!(
            "Persisted run {run_id}: {} unit result(s), {} failure(s)",
            run.unit_results.len(),
            record_ids.len()
        );
        Ok(PersistedRun { run_id, record_ids })
    }

    /// Load a complete run, including unit results and failures
    pub fn get_run(&self, run_id: RunId) -> Result<Option<AnalysisRun>> {
        debug!("Loading run {run_id}");
        let conn = self.lock()?;

        let run = conn
            .query_row(
                "SELECT invocation_id, root_paths, started_at, finished_at, files_discovered,
                     files_analyzed, files_skipped, analysis_status, coverage_percentage,
                     completeness_context, tool_health, tool_counters
                 FROM analysis_runs WHERE run_id = ?1;",
                params![run_id.0],
                |row| {
                    let mut run = AnalysisRun::new(parse_json(row, 1)?);
                    run.run_id = Some(run_id);
                    run.invocation_id = parse_text(row, 0)?;
                    run.started_at = parse_time(row, 2)?;
                    run.finished_at = parse_optional_time(row, 3)?;
                    run.files_discovered = row.get::<_, i64>(4)? as u64;
                    run.files_analyzed = row.get::<_, i64>(5)? as u64;
                    run.files_skipped = row.get::<_, i64>(6)? as u64;
                    run.analysis_status = parse_text(row, 7)?;
                    run.coverage_percentage = row.get(8)?;
                    run.completeness_context = row.get(9)?;
                    run.tool_health = parse_json(row, 10)?;
                    run.tool_counters = parse_json(row, 11)?;
                    Ok(run)
                },
            )
            .optional()
            .map_err(|e| anyhow::anyhow!("Failed to query run {run_id}: {e}"))?;

        let Some(mut run) = run else {
            debug!("Run not found: {run_id}");
            return Ok(None);
        };

        let stored = query_failures(
            &conn,
            &FailureFilter {
                run_id: Some(run_id),
                ..FailureFilter::default()
            },
        )?;
        let by_record: HashMap<RecordId, ExecutionFailure> = stored
            .iter()
            .map(|s| (s.record_id, s.failure.clone()))
            .collect();
        run.failures = stored.into_iter().map(|s| s.failure).collect();

        let mut stmt = conn
            .prepare(
                "SELECT file_path, tool_name, unit_kind, scope, status, duration_ms, exit_code,
                     output, failure_record_id
                 FROM unit_results WHERE run_id = ?1 ORDER BY seq;",
            )
            .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {e}"))?;
        run.unit_results = stmt
            .query_map(params![run_id.0], |row| {
                let failure_record_id: Option<i64> = row.get(8)?;
                Ok(FileUnitResult {
                    file_path: PathBuf::from(row.get::<_, String>(0)?),
                    tool_name: row.get(1)?,
                    unit_kind: parse_text(row, 2)?,
                    scope: parse_text(row, 3)?,
                    status: parse_text(row, 4)?,
                    duration_ms: row.get::<_, i64>(5)? as u64,
                    exit_code: row.get(6)?,
                    output: row.get(7)?,
                    failure: failure_record_id.and_then(|id| by_record.get(&RecordId(id)).cloned()),
                })
            })
            .map_err(|e| anyhow::anyhow!("Failed to query unit results: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to read unit result: {e}"))?;

        Ok(Some(run))
    }

    /// Most recent runs first
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT r.run_id, r.invocation_id, r.root_paths, r.started_at, r.finished_at,
                     r.analysis_status, r.coverage_percentage, r.files_discovered,
                     r.files_analyzed,
                     (SELECT COUNT(*) FROM failures f WHERE f.run_id = r.run_id)
                 FROM analysis_runs r ORDER BY r.run_id DESC LIMIT ?1;",
            )
            .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {e}"))?;

        let runs = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RunSummary {
                    run_id: RunId(row.get(0)?),
                    invocation_id: parse_text(row, 1)?,
                    root_paths: parse_json(row, 2)?,
                    started_at: parse_time(row, 3)?,
                    finished_at: parse_optional_time(row, 4)?,
                    analysis_status: parse_text(row, 5)?,
                    coverage_percentage: row.get(6)?,
                    files_discovered: row.get::<_, i64>(7)? as u64,
                    files_analyzed: row.get::<_, i64>(8)? as u64,
                    failure_count: row.get::<_, i64>(9)? as u64,
                })
            })
            .map_err(|e| anyhow::anyhow!("Failed to query runs: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to read run summary: {e}"))?;
        Ok(runs)
    }

    pub fn latest_run_id(&self) -> Result<Option<RunId>> {
        let conn = self.lock()?;
        let id: Option<i64> = conn
            .query_row("SELECT MAX(run_id) FROM analysis_runs;", [], |row| row.get(0))
            .map_err(|e| anyhow::anyhow!("Failed to query latest run: {e}"))?;
        Ok(id.map(RunId))
    }

    /// Failures matching every set field of `filter`, in run then unit order
    pub fn list_failures(&self, filter: &FailureFilter) -> Result<Vec<StoredFailure>> {
        let conn = self.lock()?;
        query_failures(&conn, filter)
    }

    pub fn get_failure(&self, record_id: RecordId) -> Result<Option<StoredFailure>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("{FAILURE_COLUMNS} WHERE record_id = ?1;"),
            params![record_id.0],
            failure_from_row,
        )
        .optional()
        .map_err(|e| anyhow::anyhow!("Failed to query failure {record_id}: {e}"))
    }

    pub fn record_exists(&self, record_id: RecordId) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM failures WHERE record_id = ?1;",
                params![record_id.0],
                |row| row.get(0),
            )
            .map_err(|e| anyhow::anyhow!("Failed to check failure {record_id}: {e}"))?;
        Ok(count > 0)
    }

    /// Links owned by one scope, optionally narrowed to a failure type
    pub fn links_for_scope(
        &self,
        scope: &str,
        failure_type: Option<FailureType>,
    ) -> Result<Vec<VectorLink>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{LINK_COLUMNS} WHERE scope = ?1 AND (?2 IS NULL OR failure_type = ?2)
                 ORDER BY vector_id;"
            ))
            .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {e}"))?;
        let links = stmt
            .query_map(
                params![scope, failure_type.map(|t| t.as_str())],
                link_from_row,
            )
            .map_err(|e| anyhow::anyhow!("Failed to query vector links: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to read vector link: {e}"))?;
        Ok(links)
    }

    pub fn all_links(&self) -> Result<Vec<VectorLink>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{LINK_COLUMNS} ORDER BY vector_id;"))
            .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {e}"))?;
        let links = stmt
            .query_map([], link_from_row)
            .map_err(|e| anyhow::anyhow!("Failed to query vector links: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to read vector link: {e}"))?;
        Ok(links)
    }

    /// Links whose failure record no longer exists
    pub fn links_without_records(&self) -> Result<Vec<VectorId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT l.vector_id FROM vector_links l
                 LEFT JOIN failures f ON f.record_id = l.record_id
                 WHERE f.record_id IS NULL ORDER BY l.vector_id;",
            )
            .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {e}"))?;
        let ids = stmt
            .query_map([], |row| Ok(VectorId(row.get(0)?)))
            .map_err(|e| anyhow::anyhow!("Failed to query dangling links: {e}"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to read vector id: {e}"))?;
        Ok(ids)
    }

    /// Insert, touch and delete links in one transaction
    pub fn apply_link_changes(&self, changes: &LinkChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| anyhow::anyhow!("Failed to begin transaction: {e}"))?;

        for link in &changes.insert {
            let fingerprint = serde_json::to_string(&link.fingerprint)
                .map_err(|e| anyhow::anyhow!("Failed to serialize fingerprint: {e}"))?;
            tx.execute(
                "INSERT INTO vector_links (vector_id, record_id, scope, failure_type, fingerprint,
                     first_seen_run, last_seen_run, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                params![
                    link.vector_id.0,
                    link.record_id.0,
                    link.scope,
                    link.fingerprint.failure_type.as_str(),
                    fingerprint,
                    link.first_seen_run.0,
                    link.last_seen_run.0,
                    timestamp(&link.last_seen_at),
                ],
            )
            .map_err(|e| anyhow::anyhow!("Failed to insert vector link {}: {e}", link.vector_id))?;
        }

        for (vector_id, run_id, at) in &changes.touch {
            let updated = tx
                .execute(
                    "UPDATE vector_links SET last_seen_run = ?2, last_seen_at = ?3
                     WHERE vector_id = ?1;",
                    params![vector_id.0, run_id.0, timestamp(at)],
                )
                .map_err(|e| anyhow::anyhow!("Failed to update vector link {vector_id}: {e}"))?;
            if updated == 0 {
                warn!("Vector link not found for update: {vector_id}");
            }
        }

        for vector_id in &changes.delete {
            tx.execute(
                "DELETE FROM vector_links WHERE vector_id = ?1;",
                params![vector_id.0],
            )
            .map_err(|e| anyhow::anyhow!("Failed to delete vector link {vector_id}: {e}"))?;
        }

        tx.commit()
            .map_err(|e| anyhow::anyhow!("Failed to commit vector link changes: {e}"))?;

        debug!(
            "Vector links: {} inserted, {} touched, {} deleted",
            changes.insert.len(),
            changes.touch.len(),
            changes.delete.len()
        );
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |table: &str| -> Result<u64> {
            let n: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| row.get(0))
                .map_err(|e| anyhow::anyhow!("Failed to count {table}: {e}"))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            runs: count("analysis_runs")?,
            failures: count("failures")?,
            vector_links: count("vector_links")?,
        })
    }
}

const FAILURE_COLUMNS: &str = "SELECT record_id, run_id, failure_type, severity, message, \
     file_path, tool_name, unit_kind, raw_error, is_analysis_finding, timestamp FROM failures";

const LINK_COLUMNS: &str = "SELECT vector_id, record_id, scope, fingerprint, first_seen_run, \
     last_seen_run, last_seen_at FROM vector_links";

fn query_failures(conn: &Connection, filter: &FailureFilter) -> Result<Vec<StoredFailure>> {
    let mut clauses = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(run_id) = filter.run_id {
        values.push(Value::Integer(run_id.0));
        clauses.push(format!("run_id = ?{}", values.len()));
    }
    if let Some(path) = &filter.file_path {
        values.push(Value::Text(path.to_string_lossy().into_owned()));
        clauses.push(format!("file_path = ?{}", values.len()));
    }
    if let Some(severity) = filter.min_severity {
        values.push(Value::Integer(severity.rank()));
        clauses.push(format!("severity_rank >= ?{}", values.len()));
    }
    if let Some(failure_type) = filter.failure_type {
        values.push(Value::Text(failure_type.as_str().to_string()));
        clauses.push(format!("failure_type = ?{}", values.len()));
    }

    let mut sql = FAILURE_COLUMNS.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY run_id, seq");
    if let Some(limit) = filter.limit {
        values.push(Value::Integer(limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {e}"))?;
    let failures = stmt
        .query_map(params_from_iter(values.iter()), failure_from_row)
        .map_err(|e| anyhow::anyhow!("Failed to query failures: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to read failure: {e}"))?;
    Ok(failures)
}

fn failure_from_row(row: &Row<'_>) -> rusqlite::Result<StoredFailure> {
    Ok(StoredFailure {
        record_id: RecordId(row.get(0)?),
        run_id: RunId(row.get(1)?),
        failure: ExecutionFailure {
            failure_type: parse_text(row, 2)?,
            severity: parse_text(row, 3)?,
            message: row.get(4)?,
            context: FailureContext {
                file_path: PathBuf::from(row.get::<_, String>(5)?),
                tool_name: row.get(6)?,
                unit_kind: parse_text(row, 7)?,
            },
            raw_error: row.get(8)?,
            is_analysis_finding: row.get(9)?,
            timestamp: parse_time(row, 10)?,
        },
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<VectorLink> {
    Ok(VectorLink {
        vector_id: VectorId(row.get(0)?),
        record_id: RecordId(row.get(1)?),
        scope: row.get(2)?,
        fingerprint: parse_json(row, 3)?,
        first_seen_run: RunId(row.get(4)?),
        last_seen_run: RunId(row.get(5)?),
        last_seen_at: parse_time(row, 6)?,
    })
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error<E>(idx: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error))
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_optional_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn parse_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}
