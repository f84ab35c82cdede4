//! No-op vector store: disables retrieval entirely.

use async_trait::async_trait;
use planctx_core::error::StoreError;
use planctx_core::memory::{EmbeddingRecord, NearestQuery, ScoredRecord, UpsertRequest, VectorStore};

/// A store that keeps nothing; every query comes back empty.
pub struct NoopVectorStore;

#[async_trait]
impl VectorStore for NoopVectorStore {
    fn name(&self) -> &str { "none" }

    async fn upsert(&self, _request: UpsertRequest) -> Result<String, StoreError> {
        Ok(String::new())
    }

    async fn soft_delete(&self, id: &str, _deleted_by: &str) -> Result<EmbeddingRecord, StoreError> {
        Err(StoreError::NotFound(id.to_string()))
    }

    async fn restore(&self, id: &str) -> Result<EmbeddingRecord, StoreError> {
        Err(StoreError::NotFound(id.to_string()))
    }

    async fn get(&self, _id: &str) -> Result<Option<EmbeddingRecord>, StoreError> {
        Ok(None)
    }

    async fn query_nearest(&self, _query: NearestQuery) -> Result<Vec<ScoredRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn count_active(&self, _plan_id: &str) -> Result<usize, StoreError> {
        Ok(0)
    }
}
