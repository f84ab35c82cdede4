//! Vector store implementations for planctx.

pub mod hnsw;
pub mod in_memory;
pub mod noop;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use hnsw::{HnswIndex, HnswParams};
pub use in_memory::InMemoryVectorStore;
pub use noop::NoopVectorStore;
pub use vector::{cosine_similarity, exact_nearest};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteVectorStore;

use planctx_config::StoreConfig;
use planctx_core::memory::DEFAULT_DIMENSION;

/// Settings shared by every store backend.
#[derive(Debug, Clone, Copy)]
pub struct VectorStoreOptions {
    pub dimension: usize,
    pub conflict_retries: u32,
    pub hnsw: HnswParams,
}

impl Default for VectorStoreOptions {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            conflict_retries: 3,
            hnsw: HnswParams::default(),
        }
    }
}

impl From<&StoreConfig> for VectorStoreOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            dimension: config.dimension,
            conflict_retries: config.conflict_retries,
            hnsw: HnswParams::from(&config.hnsw),
        }
    }
}
