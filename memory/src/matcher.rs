//! Error memory matcher
//!
//! Decides, for every failure of a run, whether it recurs from an earlier
//! run of the same scope or is new, and which remembered errors of that
//! scope were not seen again (resolved). A remembered error is only resolved
//! when the run actually observed its file. Planning is pure: it reads the
//! index and returns the mutations to apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use veritas_core::{AnalysisRun, ExecutionFailure, RecordId, RunId, VectorId};
use veritas_databases::{ErrorVector, FingerprintFields, VectorIndex};

use crate::embedding::Embedder;
use crate::fingerprint::fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Recurring,
    New,
}

/// How one failure of the run was matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub record_id: RecordId,
    pub vector_id: VectorId,
    pub outcome: MatchOutcome,
    /// Similarity to the matched vector; 1.0 for the failure that created it
    pub similarity: f32,
}

/// Result of matching one run against the error memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub run_id: Option<RunId>,
    pub scope: String,
    /// Remembered vectors seen again, in first-match order
    pub recurring: Vec<VectorId>,
    /// Vectors created by this run
    pub new: Vec<VectorId>,
    /// Vectors of this scope not seen again, removed from memory
    pub resolved: Vec<VectorId>,
    /// One entry per matched failure, in run order. Failures of cancelled
    /// units are not matched.
    pub assignments: Vec<Assignment>,
    /// Stored embeddings were rebuilt because the embedding function changed
    pub embedding_version_changed: bool,
}

impl MatchReport {
    pub fn is_unchanged(&self) -> bool {
        self.new.is_empty() && self.resolved.is_empty()
    }
}

/// Matching parameters
#[derive(Debug, Clone, Copy)]
pub struct MatchSettings {
    pub threshold: f32,
    pub search_k: usize,
}

/// Which remembered errors a run may confirm or resolve
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchScope {
    pub key: String,
    /// Targets whose units did not run to completion. Remembered errors on
    /// them are kept as they are.
    pub unsettled: BTreeSet<PathBuf>,
}

impl MatchScope {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            unsettled: BTreeSet::new(),
        }
    }

    pub fn for_run(run: &AnalysisRun) -> Self {
        Self {
            key: run.scope_key(),
            unsettled: run.unsettled_targets(),
        }
    }

    fn may_resolve(&self, vector: &ErrorVector) -> bool {
        vector.scope == self.key
            && !self
                .unsettled
                .contains(Path::new(&vector.fingerprint_fields.file_path))
    }
}

/// Mutations derived from one run
#[derive(Debug, Default)]
pub struct MatchPlan {
    pub report: MatchReport,
    pub new_vectors: Vec<ErrorVector>,
}

struct Pending {
    vector_id: VectorId,
    fields: FingerprintFields,
    embedding: Vec<f32>,
}

/// Match `failures` (paired with their record ids) against `index`.
///
/// Candidates are restricted to vectors with the same failure type and scope.
/// A failure that matches a vector created earlier in the same run joins it
/// instead of creating a duplicate. Unmatched vectors of the scope are
/// resolved unless their file is unsettled.
pub fn plan_matches(
    index: &VectorIndex,
    embedder: &dyn Embedder,
    failures: &[(RecordId, &ExecutionFailure)],
    scope: &MatchScope,
    run_id: Option<RunId>,
    settings: MatchSettings,
    now: DateTime<Utc>,
) -> MatchPlan {
    let mut plan = MatchPlan::default();
    plan.report.run_id = run_id;
    plan.report.scope = scope.key.clone();

    let mut pending: Vec<Pending> = Vec::new();
    let mut matched: HashSet<VectorId> = HashSet::new();

    for &(record_id, failure) in failures {
        let fields = fingerprint(failure);
        let embedding = embedder.embed(&fields);

        let remembered = index
            .search_where(&embedding, settings.search_k, |v| {
                v.scope == scope.key && v.fingerprint_fields.failure_type == fields.failure_type
            })
            .into_iter()
            .next()
            .map(|hit| (hit.vector_id, hit.similarity));

        let earlier_in_run = pending
            .iter()
            .filter(|p| p.fields.failure_type == fields.failure_type)
            .map(|p| {
                (
                    p.vector_id,
                    veritas_databases::cosine_similarity(&embedding, &p.embedding),
                )
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let assignment = match (remembered, earlier_in_run) {
            (Some((vector_id, similarity)), other)
                if similarity >= settings.threshold
                    && other.map_or(true, |(_, s)| similarity >= s) =>
            {
                if matched.insert(vector_id) {
                    plan.report.recurring.push(vector_id);
                }
                Assignment {
                    record_id,
                    vector_id,
                    outcome: MatchOutcome::Recurring,
                    similarity,
                }
            }
            (_, Some((vector_id, similarity))) if similarity >= settings.threshold => Assignment {
                record_id,
                vector_id,
                outcome: MatchOutcome::New,
                similarity,
            },
            _ => {
                let vector_id = VectorId::from(record_id);
                plan.report.new.push(vector_id);
                plan.new_vectors.push(ErrorVector {
                    vector_id,
                    record_id,
                    embedding: embedding.clone(),
                    fingerprint_fields: fields.clone(),
                    scope: scope.key.clone(),
                    last_seen_run: run_id,
                    last_seen_at: now,
                });
                pending.push(Pending {
                    vector_id,
                    fields,
                    embedding,
                });
                Assignment {
                    record_id,
                    vector_id,
                    outcome: MatchOutcome::New,
                    similarity: 1.0,
                }
            }
        };
        plan.report.assignments.push(assignment);
    }

    plan.report.resolved = index
        .iter()
        .filter(|v| scope.may_resolve(v) && !matched.contains(&v.vector_id))
        .map(|v| v.vector_id)
        .collect();

    plan
}
