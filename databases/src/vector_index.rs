//! Vector Memory Index
//!
//! Similarity-searchable store of error embeddings keyed by [`VectorId`].
//! Identities never depend on insertion order: every vector carries the id of
//! the failure record that created it, and the same id is used by the
//! relational store's link table.
//!
//! The index is persisted as a bincode snapshot written to a temporary file
//! and renamed into place, so a crash mid-save leaves the previous snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use veritas_core::{FailureType, RecordId, RunId, VectorId};

#[cfg(feature = "faiss")]
use crate::faiss::FaissAccelerator;

/// Snapshot layout version
const SNAPSHOT_FORMAT: u32 = 1;

/// Vector index errors
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector {0} is already indexed")]
    DuplicateVector(VectorId),

    #[error("Unsupported index snapshot format {0}")]
    UnsupportedFormat(u32),

    #[error("Index I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Index encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Index persist error: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("FAISS error: {0}")]
    Faiss(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// The parts of a failure that define its identity across runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FingerprintFields {
    pub failure_type: FailureType,
    pub normalized_message: String,
    pub file_path: String,
}

/// Embedding of one remembered failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorVector {
    pub vector_id: VectorId,
    /// Failure record that created this vector
    pub record_id: RecordId,
    pub embedding: Vec<f32>,
    pub fingerprint_fields: FingerprintFields,
    /// Scope key of the runs this vector belongs to
    pub scope: String,
    pub last_seen_run: Option<RunId>,
    pub last_seen_at: DateTime<Utc>,
}

/// One search result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub vector_id: VectorId,
    pub similarity: f32,
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    format: u32,
    dimension: usize,
    embedding_version: String,
    vectors: Vec<ErrorVector>,
}

/// Vector memory index
pub struct VectorIndex {
    dimension: usize,
    embedding_version: String,
    vectors: BTreeMap<VectorId, ErrorVector>,
    #[cfg(feature = "faiss")]
    accelerator: Option<std::sync::Mutex<FaissAccelerator>>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("embedding_version", &self.embedding_version)
            .field("vectors", &self.vectors.len())
            .finish()
    }
}

impl PartialEq for VectorIndex {
    fn eq(&self, other: &Self) -> bool {
        self.dimension == other.dimension
            && self.embedding_version == other.embedding_version
            && self.vectors == other.vectors
    }
}

impl VectorIndex {
    pub fn new(dimension: usize, embedding_version: impl Into<String>) -> Self {
        Self {
            dimension,
            embedding_version: embedding_version.into(),
            vectors: BTreeMap::new(),
            #[cfg(feature = "faiss")]
            accelerator: FaissAccelerator::new(dimension)
                .map(std::sync::Mutex::new)
                .map_err(|e| tracing::warn!("FAISS accelerator unavailable: {e}"))
                .ok(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedding_version(&self) -> &str {
        &self.embedding_version
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn contains(&self, vector_id: VectorId) -> bool {
        self.vectors.contains_key(&vector_id)
    }

    pub fn get(&self, vector_id: VectorId) -> Option<&ErrorVector> {
        self.vectors.get(&vector_id)
    }

    pub fn ids(&self) -> Vec<VectorId> {
        self.vectors.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorVector> {
        self.vectors.values()
    }

    pub fn add(&mut self, vector: ErrorVector) -> IndexResult<()> {
        if vector.embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: vector.embedding.len(),
            });
        }
        if self.vectors.contains_key(&vector.vector_id) {
            return Err(IndexError::DuplicateVector(vector.vector_id));
        }

        #[cfg(feature = "faiss")]
        if let Some(accelerator) = &self.accelerator {
            accelerator
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .add(vector.vector_id, &vector.embedding)?;
        }

        debug!("Indexed vector {} (record {})", vector.vector_id, vector.record_id);
        self.vectors.insert(vector.vector_id, vector);
        Ok(())
    }

    /// Remove a vector; returns it if it was present
    pub fn remove(&mut self, vector_id: VectorId) -> IndexResult<Option<ErrorVector>> {
        let removed = self.vectors.remove(&vector_id);

        #[cfg(feature = "faiss")]
        if removed.is_some() {
            if let Some(accelerator) = &self.accelerator {
                accelerator
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(vector_id)?;
            }
        }

        if removed.is_some() {
            debug!("Removed vector {vector_id}");
        }
        Ok(removed)
    }

    /// Update the last-seen marker of a vector
    pub fn touch(&mut self, vector_id: VectorId, run_id: Option<RunId>, at: DateTime<Utc>) -> bool {
        match self.vectors.get_mut(&vector_id) {
            Some(vector) => {
                vector.last_seen_run = run_id;
                vector.last_seen_at = at;
                true
            }
            None => false,
        }
    }

    /// The `k` most similar vectors, best first
    pub fn search(&self, embedding: &[f32], k: usize) -> Vec<SearchHit> {
        self.search_where(embedding, k, |_| true)
    }

    /// The `k` most similar vectors among those accepted by `filter`.
    ///
    /// Ties are broken by ascending vector id.
    pub fn search_where<F>(&self, embedding: &[f32], k: usize, filter: F) -> Vec<SearchHit>
    where
        F: Fn(&ErrorVector) -> bool,
    {
        if k == 0 || embedding.len() != self.dimension {
            return Vec::new();
        }

        #[cfg(feature = "faiss")]
        if let Some(hits) = self.accelerated_search(embedding, k, &filter) {
            return hits;
        }

        let mut hits: Vec<SearchHit> = self
            .vectors
            .values()
            .filter(|v| filter(v))
            .map(|v| SearchHit {
                vector_id: v.vector_id,
                similarity: cosine_similarity(embedding, &v.embedding),
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    /// Try the FAISS accelerator; `None` means fall back to the exact scan
    #[cfg(feature = "faiss")]
    fn accelerated_search<F>(&self, embedding: &[f32], k: usize, filter: &F) -> Option<Vec<SearchHit>>
    where
        F: Fn(&ErrorVector) -> bool,
    {
        let accelerator = self.accelerator.as_ref()?;
        let candidates = (k * 8).min(self.vectors.len());
        let raw = accelerator
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .search(embedding, candidates)
            .ok()?;

        let mut hits: Vec<SearchHit> = raw
            .into_iter()
            .filter_map(|id| self.vectors.get(&id))
            .filter(|v| filter(v))
            .map(|v| SearchHit {
                vector_id: v.vector_id,
                similarity: cosine_similarity(embedding, &v.embedding),
            })
            .collect();
        if hits.len() < k && candidates < self.vectors.len() {
            return None;
        }
        sort_hits(&mut hits);
        hits.truncate(k);
        Some(hits)
    }

    /// Replace every embedding using `embed` and adopt a new embedding
    /// version and dimension
    pub fn reembed<F>(
        &mut self,
        dimension: usize,
        embedding_version: &str,
        mut embed: F,
    ) -> IndexResult<usize>
    where
        F: FnMut(&FingerprintFields) -> Vec<f32>,
    {
        let mut rebuilt = VectorIndex::new(dimension, embedding_version);
        for mut vector in std::mem::take(&mut self.vectors).into_values() {
            vector.embedding = embed(&vector.fingerprint_fields);
            rebuilt.add(vector)?;
        }
        let count = rebuilt.len();
        *self = rebuilt;
        info!("Re-embedded {count} vector(s) with embedding version {embedding_version}");
        Ok(count)
    }

    /// Write a snapshot to `path` atomically
    pub fn save(&self, path: &Path) -> IndexResult<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let snapshot = IndexSnapshot {
            format: SNAPSHOT_FORMAT,
            dimension: self.dimension,
            embedding_version: self.embedding_version.clone(),
            vectors: self.vectors.values().cloned().collect(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            bincode::serialize_into(&mut writer, &snapshot)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;

        info!("Saved {} vector(s) to {}", self.vectors.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> IndexResult<Self> {
        let reader = BufReader::new(fs::File::open(path)?);
        let snapshot: IndexSnapshot = bincode::deserialize_from(reader)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(IndexError::UnsupportedFormat(snapshot.format));
        }

        let mut index = VectorIndex::new(snapshot.dimension, snapshot.embedding_version);
        for vector in snapshot.vectors {
            index.add(vector)?;
        }

        info!("Loaded {} vector(s) from {}", index.len(), path.display());
        Ok(index)
    }

    /// Load `path` if it exists, otherwise start empty
    pub fn load_or_new(
        path: &Path,
        dimension: usize,
        embedding_version: &str,
    ) -> IndexResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No index at {}, starting empty", path.display());
            Ok(Self::new(dimension, embedding_version))
        }
    }
}

fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.vector_id.cmp(&b.vector_id))
    });
}

/// Cosine similarity of two equal-length vectors; 0 when either is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(id: i64, embedding: Vec<f32>, failure_type: FailureType, scope: &str) -> ErrorVector {
        ErrorVector {
            vector_id: VectorId(id),
            record_id: RecordId(id),
            embedding,
            fingerprint_fields: FingerprintFields {
                failure_type,
                normalized_message: format!("message {id}"),
                file_path: format!("/src/{id}.py"),
            },
            scope: scope.to_string(),
            last_seen_run: Some(RunId(1)),
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_add_search_remove() {
        let mut index = VectorIndex::new(3, "v1");
        index.add(vector(1, vec![1.0, 0.0, 0.0], FailureType::ImportError, "s")).unwrap();
        index.add(vector(2, vec![0.9, 0.1, 0.0], FailureType::ImportError, "s")).unwrap();
        index.add(vector(3, vec![0.0, 0.0, 1.0], FailureType::ImportError, "s")).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].vector_id, VectorId(1));
        assert_eq!(hits[1].vector_id, VectorId(2));

        assert!(index.remove(VectorId(1)).unwrap().is_some());
        assert!(index.remove(VectorId(1)).unwrap().is_none());
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 1)[0].vector_id, VectorId(2));
    }

    #[test]
    fn test_search_where_filters() {
        let mut index = VectorIndex::new(2, "v1");
        index.add(vector(1, vec![1.0, 0.0], FailureType::ImportError, "a")).unwrap();
        index.add(vector(2, vec![1.0, 0.0], FailureType::SyntaxError, "a")).unwrap();
        index.add(vector(3, vec![1.0, 0.0], FailureType::ImportError, "b")).unwrap();

        let hits = index.search_where(&[1.0, 0.0], 5, |v| {
            v.fingerprint_fields.failure_type == FailureType::ImportError && v.scope == "a"
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vector_id, VectorId(1));
    }

    #[test]
    fn test_rejects_bad_dimension_and_duplicates() {
        let mut index = VectorIndex::new(2, "v1");
        assert!(matches!(
            index.add(vector(1, vec![1.0], FailureType::ToolError, "s")),
            Err(IndexError::DimensionMismatch { expected: 2, got: 1 })
        ));
        index.add(vector(1, vec![1.0, 0.0], FailureType::ToolError, "s")).unwrap();
        assert!(matches!(
            index.add(vector(1, vec![0.0, 1.0], FailureType::ToolError, "s")),
            Err(IndexError::DuplicateVector(VectorId(1)))
        ));
    }

    #[test]
    fn test_ties_break_by_vector_id() {
        let mut index = VectorIndex::new(2, "v1");
        index.add(vector(9, vec![1.0, 0.0], FailureType::ToolError, "s")).unwrap();
        index.add(vector(4, vec![1.0, 0.0], FailureType::ToolError, "s")).unwrap();
        let hits = index.search(&[1.0, 0.0], 2);
        assert_eq!(hits[0].vector_id, VectorId(4));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.idx");

        let mut index = VectorIndex::new(4, "hashing-v1");
        index.add(vector(7, vec![0.1, 0.2, 0.3, 0.4], FailureType::ImportError, "s")).unwrap();
        index.add(vector(12, vec![-0.5, 0.0, 0.25, 1.0], FailureType::Timeout, "t")).unwrap();
        index.remove(VectorId(7)).unwrap();
        index.add(vector(13, vec![1.0, 1.0, 1.0, 1.0], FailureType::Timeout, "t")).unwrap();
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.ids(), vec![VectorId(12), VectorId(13)]);
        assert_eq!(loaded.get(VectorId(12)).unwrap().record_id, RecordId(12));
        assert_eq!(loaded.embedding_version(), "hashing-v1");
    }

    #[test]
    fn test_load_or_new_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::load_or_new(&dir.path().join("absent.idx"), 8, "v1").unwrap();
        assert!(index.is_empty());
        assert_eq!(index.dimension(), 8);
    }

    #[test]
    fn test_reembed_replaces_embeddings() {
        let mut index = VectorIndex::new(2, "v1");
        index.add(vector(1, vec![1.0, 0.0], FailureType::ToolError, "s")).unwrap();
        let count = index.reembed(3, "v2", |_| vec![0.0, 1.0, 0.0]).unwrap();
        assert_eq!(count, 1);
        assert_eq!(index.embedding_version(), "v2");
        assert_eq!(index.dimension(), 3);
        assert_eq!(index.get(VectorId(1)).unwrap().embedding, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let mut index = VectorIndex::new(2, "v1");
        index.add(vector(1, vec![1.0, 0.0], FailureType::ToolError, "s")).unwrap();
        assert!(index.touch(VectorId(1), Some(RunId(5)), Utc::now()));
        assert_eq!(index.get(VectorId(1)).unwrap().last_seen_run, Some(RunId(5)));
        assert!(!index.touch(VectorId(2), None, Utc::now()));
    }
}
