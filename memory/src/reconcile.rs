//! Store/index reconciliation
//!
//! The run store and the vector index are written separately, so a crash
//! between the two leaves them out of step. Reconciliation compares the
//! `vector_links` table with the index and repairs the difference:
//!
//! | Condition | Repair |
//! |-----------|--------|
//! | vector with no link | remove the vector |
//! | link with no vector | rebuild the vector from the link's fingerprint |
//! | link whose failure record is gone | delete the link and its vector |

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use veritas_core::VectorId;
use veritas_databases::{ErrorVector, IndexResult, VectorIndex, VectorLink};

use crate::embedding::Embedder;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Vectors present in the index with no link row
    pub orphan_vectors: Vec<VectorId>,
    /// Links with no vector in the index
    pub dangling_links: Vec<VectorId>,
    /// Links pointing at a failure record that no longer exists
    pub missing_records: Vec<VectorId>,
    /// Number of repairs applied
    pub repaired: usize,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.orphan_vectors.is_empty()
            && self.dangling_links.is_empty()
            && self.missing_records.is_empty()
    }
}

/// Compare `links` with `index` and repair the index in place.
///
/// Returns the report and the links the caller must delete from the store.
pub fn reconcile_index(
    index: &mut VectorIndex,
    links: &[VectorLink],
    links_without_records: &[VectorId],
    embedder: &dyn Embedder,
) -> IndexResult<(ReconcileReport, Vec<VectorId>)> {
    let mut report = ReconcileReport::default();
    let missing: HashSet<VectorId> = links_without_records.iter().copied().collect();
    let live: HashMap<VectorId, &VectorLink> = links
        .iter()
        .filter(|l| !missing.contains(&l.vector_id))
        .map(|l| (l.vector_id, l))
        .collect();

    for vector_id in index.ids() {
        if !live.contains_key(&vector_id) && !missing.contains(&vector_id) {
            warn!("Removing orphan vector {vector_id}");
            index.remove(vector_id)?;
            report.orphan_vectors.push(vector_id);
        }
    }

    for vector_id in links_without_records {
        warn!("Dropping vector link {vector_id}: failure record missing");
        index.remove(*vector_id)?;
        report.missing_records.push(*vector_id);
    }

    let mut dangling: Vec<&VectorLink> = live
        .values()
        .filter(|l| !index.contains(l.vector_id))
        .copied()
        .collect();
    dangling.sort_by_key(|l| l.vector_id);
    for link in dangling {
        warn!("Rebuilding vector {} from its link", link.vector_id);
        index.add(ErrorVector {
            vector_id: link.vector_id,
            record_id: link.record_id,
            embedding: embedder.embed(&link.fingerprint),
            fingerprint_fields: link.fingerprint.clone(),
            scope: link.scope.clone(),
            last_seen_run: Some(link.last_seen_run),
            last_seen_at: link.last_seen_at,
        })?;
        report.dangling_links.push(link.vector_id);
    }

    report.repaired =
        report.orphan_vectors.len() + report.dangling_links.len() + report.missing_records.len();
    if report.is_consistent() {
        info!("Error memory consistent: {} vector(s)", index.len());
    } else {
        info!(
            "Reconciled error memory: {} orphan vector(s), {} dangling link(s), {} missing record(s)",
            report.orphan_vectors.len(),
            report.dangling_links.len(),
            report.missing_records.len()
        );
    }

    let deletions = report.missing_records.clone();
    Ok((report, deletions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use chrono::Utc;
    use veritas_core::{FailureType, RecordId, RunId};
    use veritas_databases::FingerprintFields;

    fn link(id: i64) -> VectorLink {
        VectorLink {
            vector_id: VectorId(id),
            record_id: RecordId(id),
            scope: "/repo".to_string(),
            fingerprint: FingerprintFields {
                failure_type: FailureType::ImportError,
                normalized_message: format!("no module named m{id}"),
                file_path: format!("/repo/{id}.py"),
            },
            first_seen_run: RunId(1),
            last_seen_run: RunId(1),
            last_seen_at: Utc::now(),
        }
    }

    fn vector_for(link: &VectorLink, embedder: &HashingEmbedder) -> ErrorVector {
        ErrorVector {
            vector_id: link.vector_id,
            record_id: link.record_id,
            embedding: embedder.embed(&link.fingerprint),
            fingerprint_fields: link.fingerprint.clone(),
            scope: link.scope.clone(),
            last_seen_run: Some(link.last_seen_run),
            last_seen_at: link.last_seen_at,
        }
    }

    #[test]
    fn test_consistent_state_is_untouched() {
        let embedder = HashingEmbedder::new(64);
        let links = vec![link(1), link(2)];
        let mut index = VectorIndex::new(64, embedder.version());
        for l in &links {
            index.add(vector_for(l, &embedder)).unwrap();
        }

        let (report, deletions) = reconcile_index(&mut index, &links, &[], &embedder).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.repaired, 0);
        assert!(deletions.is_empty());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_repairs_each_kind_of_drift() {
        let embedder = HashingEmbedder::new(64);
        let links = vec![link(1), link(2), link(3)];
        let mut index = VectorIndex::new(64, embedder.version());
        // 1 is linked, 2 lost its vector, 3 lost its record, 4 lost its link
        index.add(vector_for(&links[0], &embedder)).unwrap();
        index.add(vector_for(&links[2], &embedder)).unwrap();
        index.add(vector_for(&link(4), &embedder)).unwrap();

        let (report, deletions) =
            reconcile_index(&mut index, &links, &[VectorId(3)], &embedder).unwrap();

        assert_eq!(report.orphan_vectors, vec![VectorId(4)]);
        assert_eq!(report.dangling_links, vec![VectorId(2)]);
        assert_eq!(report.missing_records, vec![VectorId(3)]);
        assert_eq!(report.repaired, 3);
        assert_eq!(deletions, vec![VectorId(3)]);
        assert_eq!(index.ids(), vec![VectorId(1), VectorId(2)]);
        assert_eq!(
            index.get(VectorId(2)).unwrap().embedding,
            embedder.embed(&links[1].fingerprint)
        );
    }
}
