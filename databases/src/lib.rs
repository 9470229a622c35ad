//! Veritas Databases Module
//!
//! Persistence for the execution engine: the SQLite run store holding runs,
//! unit results, failures and vector links, and the on-disk vector index
//! backing the error memory (optionally accelerated by FAISS).

#[cfg(feature = "faiss")]
pub mod faiss;
pub mod sqlite;
pub mod vector_index;

pub use sqlite::{
    FailureFilter, LinkChanges, PersistedRun, RunStore, RunSummary, StoreStats, StoredFailure,
    VectorLink, SCHEMA_VERSION,
};
pub use vector_index::{
    cosine_similarity, ErrorVector, FingerprintFields, IndexError, IndexResult, SearchHit,
    VectorIndex,
};
