//! Veritas Memory Module
//!
//! Cross-run error memory. Failures of each persisted run are embedded and
//! matched against the vector index to tell recurring errors from new ones,
//! and remembered errors that stopped occurring are resolved. The run store's
//! `vector_links` table and the index are kept in step, and
//! [`ErrorMemory::reconcile`] repairs them after a crash.
//!
//! The index is single-writer, multi-reader: searches share a read lock,
//! while matching, reconciliation and saving are serialised.

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use veritas_core::{AnalysisRun, ExecutionFailure, MemorySettings, RecordId, RunId};
use veritas_databases::{
    IndexError, LinkChanges, PersistedRun, RunStore, SearchHit, VectorIndex, VectorLink,
};

pub mod embedding;
pub mod fingerprint;
pub mod matcher;
pub mod reconcile;

pub use embedding::{Embedder, HashingEmbedder};
pub use fingerprint::{fingerprint, normalize_message};
pub use matcher::{
    plan_matches, Assignment, MatchOutcome, MatchPlan, MatchReport, MatchScope, MatchSettings,
};
pub use reconcile::{reconcile_index, ReconcileReport};

/// Error memory errors
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Vector index error: {0}")]
    Index(#[from] IndexError),

    #[error("Run store error: {0:#}")]
    Store(anyhow::Error),

    #[error("Embedder dimension {embedder} does not match configured dimension {configured}")]
    DimensionMismatch { embedder: usize, configured: usize },

    #[error("Failure count {failures} does not match {records} persisted record id(s)")]
    RecordMismatch { failures: usize, records: usize },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Error memory over a run store and a persisted vector index
pub struct ErrorMemory {
    store: RunStore,
    index: Arc<RwLock<VectorIndex>>,
    writer: Mutex<()>,
    embedder: Arc<dyn Embedder>,
    settings: MemorySettings,
    version_changed: AtomicBool,
}

impl ErrorMemory {
    /// Open with the built-in [`HashingEmbedder`]
    pub async fn open(settings: &MemorySettings, store: RunStore) -> MemoryResult<Self> {
        let embedder = Arc::new(HashingEmbedder::new(settings.embedding_dimension));
        Self::open_with_embedder(settings, store, embedder).await
    }

    /// Load the index from `settings.index_path`, re-embedding it if the
    /// embedding function changed, and reconcile when configured to
    pub async fn open_with_embedder(
        settings: &MemorySettings,
        store: RunStore,
        embedder: Arc<dyn Embedder>,
    ) -> MemoryResult<Self> {
        if embedder.dimension() != settings.embedding_dimension {
            return Err(MemoryError::DimensionMismatch {
                embedder: embedder.dimension(),
                configured: settings.embedding_dimension,
            });
        }

        let (index, changed) = {
            let embedder = Arc::clone(&embedder);
            let path = settings.index_path.clone();
            tokio::task::spawn_blocking(move || load_index(&path, embedder.as_ref())).await??
        };

        let memory = Self {
            store,
            index: Arc::new(RwLock::new(index)),
            writer: Mutex::new(()),
            embedder,
            settings: settings.clone(),
            version_changed: AtomicBool::new(changed),
        };

        if changed {
            memory.persist_index().await?;
        }
        if settings.reconcile_on_start {
            memory.reconcile().await?;
        }

        info!(
            "Error memory ready: {} vector(s), embedding {}",
            memory.len().await,
            memory.embedder.version()
        );
        Ok(memory)
    }

    /// Shared handle for concurrent readers
    pub fn index(&self) -> Arc<RwLock<VectorIndex>> {
        Arc::clone(&self.index)
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Remembered errors most similar to `failure`
    pub async fn similar(&self, failure: &ExecutionFailure, k: usize) -> Vec<SearchHit> {
        let embedding = self.embedder.embed(&fingerprint(failure));
        self.index.read().await.search(&embedding, k)
    }

    /// Match a persisted run against the memory and update it.
    ///
    /// `persisted.record_ids` must pair one-to-one with `run.failures`.
    /// Failures that only record a cancelled unit are not remembered, and
    /// errors on targets the run did not observe are neither confirmed nor
    /// resolved. The in-memory index is mutated first, then the link changes are committed,
    /// then the index is saved; if the commit fails the index is reloaded
    /// from disk.
    pub async fn classify(
        &self,
        run: &AnalysisRun,
        persisted: &PersistedRun,
    ) -> MemoryResult<MatchReport> {
        if run.failures.len() != persisted.record_ids.len() {
            return Err(MemoryError::RecordMismatch {
                failures: run.failures.len(),
                records: persisted.record_ids.len(),
            });
        }

        let _writer = self.writer.lock().await;
        let run_id = persisted.run_id;
        let scope = MatchScope::for_run(run);
        let now = Utc::now();
        let pairs: Vec<(RecordId, &ExecutionFailure)> = persisted
            .record_ids
            .iter()
            .copied()
            .zip(run.failures.iter())
            .filter(|(_, failure)| !run.is_cancellation(failure))
            .collect();
        if !scope.unsettled.is_empty() {
            debug!(
                "Run {run_id}: {} target(s) not observed, their remembered errors are kept",
                scope.unsettled.len()
            );
        }

        let mut index = self.index.write().await;
        let mut plan = plan_matches(
            &index,
            self.embedder.as_ref(),
            &pairs,
            &scope,
            Some(run_id),
            MatchSettings {
                threshold: self.settings.similarity_threshold,
                search_k: self.settings.search_k,
            },
            now,
        );
        plan.report.embedding_version_changed = self.version_changed.load(Ordering::SeqCst);

        let changes = LinkChanges {
            insert: plan
                .new_vectors
                .iter()
                .map(|v| VectorLink {
                    vector_id: v.vector_id,
                    record_id: v.record_id,
                    scope: v.scope.clone(),
                    fingerprint: v.fingerprint_fields.clone(),
                    first_seen_run: run_id,
                    last_seen_run: run_id,
                    last_seen_at: now,
                })
                .collect(),
            touch: plan
                .report
                .recurring
                .iter()
                .map(|id| (*id, run_id, now))
                .collect(),
            delete: plan.report.resolved.clone(),
        };

        if let Err(e) = apply_plan(&mut index, &plan, run_id) {
            self.restore(&mut index);
            return Err(e.into());
        }

        let store = self.store.clone();
        let committed = tokio::task::spawn_blocking(move || store.apply_link_changes(&changes)).await;
        let failure = match committed {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(MemoryError::Store(e)),
            Err(e) => Some(MemoryError::Task(e)),
        };
        if let Some(error) = failure {
            warn!("Vector link commit failed for run {run_id}, reloading index: {error}");
            self.restore(&mut index);
            return Err(error);
        }
        drop(index);

        self.persist_index().await?;
        self.version_changed.store(false, Ordering::SeqCst);

        info!(
            "Run {run_id}: {} recurring, {} new, {} resolved",
            plan.report.recurring.len(),
            plan.report.new.len(),
            plan.report.resolved.len()
        );
        Ok(plan.report)
    }

    /// Compare the link table with the index and repair any drift
    pub async fn reconcile(&self) -> MemoryResult<ReconcileReport> {
        let _writer = self.writer.lock().await;

        let store = self.store.clone();
        let (links, without_records) = tokio::task::spawn_blocking(move || {
            Ok::<_, anyhow::Error>((store.all_links()?, store.links_without_records()?))
        })
        .await?
        .map_err(MemoryError::Store)?;

        let (report, deletions) = {
            let mut index = self.index.write().await;
            reconcile_index(&mut index, &links, &without_records, self.embedder.as_ref())?
        };

        if !deletions.is_empty() {
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || {
                store.apply_link_changes(&LinkChanges {
                    delete: deletions,
                    ..LinkChanges::default()
                })
            })
            .await?
            .map_err(MemoryError::Store)?;
        }
        if report.repaired > 0 {
            self.persist_index().await?;
        }
        Ok(report)
    }

    /// Write the index snapshot
    pub async fn save(&self) -> MemoryResult<()> {
        let _writer = self.writer.lock().await;
        self.persist_index().await
    }

    async fn persist_index(&self) -> MemoryResult<()> {
        let index = Arc::clone(&self.index);
        let path = self.settings.index_path.clone();
        tokio::task::spawn_blocking(move || index.blocking_read().save(&path)).await??;
        Ok(())
    }

    fn restore(&self, index: &mut VectorIndex) {
        match load_index(&self.settings.index_path, self.embedder.as_ref()) {
            Ok((restored, _)) => *index = restored,
            Err(e) => warn!("Failed to reload vector index: {e}"),
        }
    }
}

/// Load the snapshot at `path` (or start empty) and bring it to the
/// embedder's version; the flag reports whether embeddings were rebuilt
fn load_index(path: &Path, embedder: &dyn Embedder) -> Result<(VectorIndex, bool), IndexError> {
    let version = embedder.version();
    let mut index = VectorIndex::load_or_new(path, embedder.dimension(), &version)?;
    let changed = index.embedding_version() != version || index.dimension() != embedder.dimension();
    if changed {
        warn!(
            "Embedding version changed from {} to {version}; re-embedding stored vectors",
            index.embedding_version()
        );
        index.reembed(embedder.dimension(), &version, |fields| embedder.embed(fields))?;
    }
    Ok((index, changed))
}

fn apply_plan(index: &mut VectorIndex, plan: &MatchPlan, run_id: RunId) -> Result<(), IndexError> {
    for vector in &plan.new_vectors {
        index.add(vector.clone())?;
    }
    let now = Utc::now();
    for vector_id in &plan.report.recurring {
        index.touch(*vector_id, Some(run_id), now);
    }
    for vector_id in &plan.report.resolved {
        index.remove(*vector_id)?;
    }
    debug!(
        "Applied match plan for run {run_id}: index now holds {} vector(s)",
        index.len()
    );
    Ok(())
}
