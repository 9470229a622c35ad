//! Run orchestrator
//!
//! Drives one analysis run through its states:
//!
//! ```text
//! INIT -> DISCOVERING -> EXECUTING -> AGGREGATING -> MATCHING -> DONE
//!   \________\______________\____________\_____________\-----> FAILED
//! ```
//!
//! Units execute on a bounded pool. Each finished unit is handed to the
//! coverage accountant's task as soon as it completes; a slow unit only
//! holds its own pool slot. Run-level cancellation (an explicit stop or the
//! run timeout) reaches every in-flight unit, and units that never got to
//! run are recorded as cancelled rather than dropped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use veritas_core::{
    spawn_accountant, AnalysisRun, CoverageAccountant, PlannedUnit, ToolScope, VeritasConfig,
    VeritasError, VeritasResult,
};
use veritas_databases::RunStore;
use veritas_memory::{ErrorMemory, MatchReport};
use veritas_tools::{AnalysisTool, AnalysisUnit, HealthRegistry, Sandbox, ToolManager};

use crate::discovery::{DiscoveryError, FileDiscovery, GlobDiscovery};

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Discovering,
    Executing,
    Aggregating,
    Matching,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// Everything a finished run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: AnalysisRun,
    pub matches: MatchReport,
    /// The run budget elapsed and outstanding units were cancelled
    pub run_timed_out: bool,
    /// The caller cancelled the run
    pub cancelled: bool,
}

/// One planned unit and what it needs to execute
struct Job {
    seq: u64,
    unit: AnalysisUnit,
    timeout_ms: u64,
}

/// Run orchestrator
pub struct Orchestrator {
    config: VeritasConfig,
    tools: ToolManager,
    discovery: Arc<dyn FileDiscovery>,
    store: RunStore,
    memory: Arc<ErrorMemory>,
    state: watch::Sender<RunState>,
}

impl Orchestrator {
    pub fn new(
        config: VeritasConfig,
        tools: ToolManager,
        discovery: Arc<dyn FileDiscovery>,
        store: RunStore,
        memory: Arc<ErrorMemory>,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Init);
        Self {
            config,
            tools,
            discovery,
            store,
            memory,
            state,
        }
    }

    /// Open the run store and error memory named by `config`
    pub async fn open(config: VeritasConfig) -> VeritasResult<Self> {
        config.validate()?;

        let db_path = config.storage.database_path.clone();
        let store = tokio::task::spawn_blocking(move || RunStore::open(&db_path))
            .await
            .map_err(|e| VeritasError::StoreUnavailable(e.to_string()))?
            .map_err(|e| VeritasError::StoreUnavailable(format!("{e:#}")))?;

        let memory = ErrorMemory::open(&config.memory, store.clone())
            .await
            .map_err(|e| VeritasError::IndexUnavailable(e.to_string()))?;

        let discovery = GlobDiscovery::new(&config.discovery)
            .map_err(|e| VeritasError::InvalidConfig(e.to_string()))?;
        let tools = ToolManager::from_config(&config);

        Ok(Self::new(
            config,
            tools,
            Arc::new(discovery),
            store,
            Arc::new(memory),
        ))
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn memory(&self) -> &Arc<ErrorMemory> {
        &self.memory
    }

    pub fn tools(&self) -> &ToolManager {
        &self.tools
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn transition(&self, next: RunState) {
        let previous = self.state.send_replace(next);
        info!("Run state {previous:?} -> {next:?}");
    }

    fn fail(&self, error: VeritasError) -> VeritasError {
        error!("Run failed: {error}");
        self.transition(RunState::Failed);
        error
    }

    /// Analyse `roots`. Setup errors return `Err` and leave the orchestrator
    /// in [`RunState::Failed`]; everything that goes wrong inside a unit is
    /// part of the returned run.
    pub async fn run(
        &self,
        roots: Vec<PathBuf>,
        cancel: CancellationToken,
    ) -> VeritasResult<RunReport> {
        self.transition(RunState::Init);

        let roots = self.resolve_roots(roots).map_err(|e| self.fail(e))?;
        let mut run = AnalysisRun::new(roots.clone());
        info!(
            "Starting run {} over {} root(s)",
            run.invocation_id,
            roots.len()
        );

        self.transition(RunState::Discovering);
        let discovery = Arc::clone(&self.discovery);
        let discover_roots = roots.clone();
        let discovered = tokio::task::spawn_blocking(move || discovery.discover(&discover_roots))
            .await
            .map_err(|e| {
                self.fail(VeritasError::InvalidConfig(format!(
                    "Discovery task failed: {e}"
                )))
            })?
            .map_err(|e| {
                self.fail(match e {
                    DiscoveryError::RootNotFound(path) => VeritasError::RootNotFound(path),
                    other => VeritasError::InvalidConfig(other.to_string()),
                })
            })?;
        if cancel.is_cancelled() {
            return Err(self.fail(VeritasError::Cancelled));
        }

        self.transition(RunState::Executing);
        let mut accountant = CoverageAccountant::new(&discovered.files, discovered.excluded);
        let jobs = self.plan(&discovered.files, &roots, &mut accountant);
        info!(
            "Planned {} unit(s) over {} file(s) with {} tool(s)",
            jobs.len(),
            discovered.files.len(),
            self.tools.tools().len()
        );

        let health = Arc::new(HealthRegistry::new(self.config.execution.probe_timeout_ms));
        let sandbox = Sandbox::new(Arc::clone(&health), self.config.execution.max_output_bytes);
        let run_cancel = cancel.child_token();
        let run_timed_out = Arc::new(AtomicBool::new(false));
        let timer = self.config.execution.run_timeout_ms.map(|ms| {
            let run_cancel = run_cancel.clone();
            let flag = Arc::clone(&run_timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                warn!("Run timeout of {ms}ms reached, cancelling outstanding units");
                flag.store(true, Ordering::SeqCst);
                run_cancel.cancel();
            })
        });

        let (sink, accountant_task) = spawn_accountant(accountant);
        let pool = Arc::new(Semaphore::new(self.config.execution.effective_pool_size()));
        let mut workers = JoinSet::new();
        for job in jobs {
            let pool = Arc::clone(&pool);
            let sandbox = sandbox.clone();
            let sink = sink.clone();
            let cancel = run_cancel.clone();
            workers.spawn(async move {
                let _permit = tokio::select! {
                    permit = pool.acquire_owned() => permit.ok(),
                    _ = cancel.cancelled() => None,
                };
                let result = sandbox.execute(&job.unit, job.timeout_ms, &cancel).await;
                debug!(
                    "Unit {} finished: {} on {} -> {:?}",
                    job.seq,
                    result.tool_name,
                    result.file_path.display(),
                    result.status
                );
                if !sink.record(job.seq, result) {
                    warn!("Coverage accountant gone; dropping result of unit {}", job.seq);
                }
            });
        }
        drop(sink);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                // The accountant reports the unit as missing
                error!("Worker task failed: {e}");
            }
        }
        if let Some(timer) = timer {
            timer.abort();
        }

        self.transition(RunState::Aggregating);
        let accountant = accountant_task.await.map_err(|e| {
            self.fail(VeritasError::InvalidConfig(format!(
                "Coverage accountant failed: {e}"
            )))
        })?;
        let aggregate = accountant.finalize();
        run.apply_coverage(aggregate.summary);
        run.unit_results = aggregate.unit_results;
        run.failures = aggregate.failures;
        run.tool_health = health.report();
        run.finished_at = Some(Utc::now());
        info!(
            "Run {} {}: {}/{} file(s) analysed ({:.1}%), {} failure(s): {}",
            run.invocation_id,
            run.analysis_status,
            run.files_analyzed,
            run.files_discovered,
            run.coverage_percentage,
            run.failures.len(),
            run.completeness_context
        );

        let store = self.store.clone();
        let snapshot = run.clone();
        let persisted = tokio::task::spawn_blocking(move || store.persist_run(&snapshot))
            .await
            .map_err(|e| self.fail(VeritasError::StoreUnavailable(e.to_string())))?
            .map_err(|e| self.fail(VeritasError::StoreUnavailable(format!("{e:#}"))))?;
        run.run_id = Some(persisted.run_id);

        self.transition(RunState::Matching);
        let matches = self
            .memory
            .classify(&run, &persisted)
            .await
            .map_err(|e| self.fail(VeritasError::IndexUnavailable(e.to_string())))?;

        self.transition(RunState::Done);
        Ok(RunReport {
            run,
            matches,
            run_timed_out: run_timed_out.load(Ordering::SeqCst),
            cancelled: cancel.is_cancelled(),
        })
    }

    fn resolve_roots(&self, roots: Vec<PathBuf>) -> VeritasResult<Vec<PathBuf>> {
        if roots.is_empty() {
            return Err(VeritasError::NoRoots);
        }
        let mut resolved = Vec::with_capacity(roots.len());
        for root in roots {
            if !root.exists() {
                return Err(VeritasError::RootNotFound(root));
            }
            resolved.push(
                root.canonicalize()
                    .map_err(|_| VeritasError::RootNotFound(root.clone()))?,
            );
        }
        resolved.sort();
        resolved.dedup();
        Ok(resolved)
    }

    /// Per-file tools run on every file in file order; codebase tools run
    /// once per root
    fn plan(
        &self,
        files: &[PathBuf],
        roots: &[PathBuf],
        accountant: &mut CoverageAccountant,
    ) -> Vec<Job> {
        let mut jobs = Vec::new();
        let mut push = |tool: &Arc<dyn AnalysisTool>, target: &PathBuf| {
            let seq = jobs.len() as u64;
            accountant.plan(PlannedUnit {
                seq,
                tool_name: tool.name().to_string(),
                unit_kind: tool.kind(),
                scope: tool.scope(),
                file_path: target.clone(),
            });
            jobs.push(Job {
                seq,
                unit: AnalysisUnit {
                    tool: Arc::clone(tool),
                    target: target.clone(),
                },
                timeout_ms: self.config.timeout_for_tool(tool.name()),
            });
        };

        for file in files {
            for tool in self.tools.tools() {
                if tool.scope() == ToolScope::PerFile {
                    push(tool, file);
                }
            }
        }
        for tool in self.tools.tools() {
            if tool.scope() == ToolScope::Codebase {
                for root in roots {
                    push(tool, root);
                }
            }
        }
        jobs
    }
}
