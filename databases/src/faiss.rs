//! FAISS accelerator for the vector memory index
//!
//! An `IDMap,Flat` inner-product index keyed by [`VectorId`]. Embeddings are
//! L2-normalised on the way in so inner product equals cosine similarity.
//! The accelerator is never persisted; [`crate::VectorIndex::load`] rebuilds
//! it from the snapshot's embeddings.

use faiss::{index::IndexImpl, index_factory, selector::IdSelector, Idx, Index, MetricType};
use tracing::debug;

use veritas_core::VectorId;

use crate::vector_index::{IndexError, IndexResult};

/// FAISS index manager
pub struct FaissAccelerator {
    index: IndexImpl,
    dimension: usize,
}

impl FaissAccelerator {
    pub fn new(dimension: usize) -> IndexResult<Self> {
        let index = index_factory(dimension as u32, "IDMap,Flat", MetricType::InnerProduct)
            .map_err(|e| IndexError::Faiss(format!("Failed to create FAISS index: {e}")))?;
        debug!("Created FAISS IDMap,Flat index with dimension {dimension}");
        Ok(Self { index, dimension })
    }

    pub fn add(&mut self, vector_id: VectorId, embedding: &[f32]) -> IndexResult<()> {
        let normalized = normalize(embedding);
        self.index
            .add_with_ids(&normalized, &[to_idx(vector_id)])
            .map_err(|e| IndexError::Faiss(format!("Failed to add vector {vector_id}: {e}")))
    }

    pub fn remove(&mut self, vector_id: VectorId) -> IndexResult<()> {
        let selector = IdSelector::batch(&[to_idx(vector_id)])
            .map_err(|e| IndexError::Faiss(format!("Failed to build id selector: {e}")))?;
        self.index
            .remove_ids(&selector)
            .map_err(|e| IndexError::Faiss(format!("Failed to remove vector {vector_id}: {e}")))?;
        Ok(())
    }

    /// Ids of up to `k` nearest vectors, best first
    pub fn search(&mut self, embedding: &[f32], k: usize) -> IndexResult<Vec<VectorId>> {
        if k == 0 || embedding.len() != self.dimension {
            return Ok(Vec::new());
        }
        let query = normalize(embedding);
        let result = self
            .index
            .search(&query, k)
            .map_err(|e| IndexError::Faiss(format!("FAISS search failed: {e}")))?;
        Ok(result
            .labels
            .into_iter()
            .filter_map(|label| label.get())
            .map(|id| VectorId(id as i64))
            .collect())
    }
}

fn to_idx(vector_id: VectorId) -> Idx {
    Idx::new(vector_id.0 as u64)
}

fn normalize(embedding: &[f32]) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        embedding.iter().map(|x| x / norm).collect()
    } else {
        embedding.to_vec()
    }
}
