//! In-memory vector store: useful for testing and ephemeral sessions.
//!
//! Writes to a reference are version-checked: an upsert reads the current
//! `(id, version)` for its reference, then applies only if that observation
//! still holds under the write lock. A lost race is re-read and retried a
//! bounded number of times before surfacing as a conflict.

use crate::VectorStoreOptions;
use crate::hnsw::HnswIndex;
use crate::vector::{self, check_dimension, cosine_similarity};
use async_trait::async_trait;
use chrono::Utc;
use planctx_core::error::StoreError;
use planctx_core::memory::{
    EmbeddingRecord, NearestQuery, ReferenceKey, ScoredRecord, SoftDelete, UpsertRequest,
    VectorStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    records: HashMap<String, EmbeddingRecord>,
    /// Active record id per reference
    active_refs: HashMap<ReferenceKey, String>,
    /// One ANN index per plan
    indexes: HashMap<String, HnswIndex>,
}

impl State {
    fn observe(&self, key: &ReferenceKey) -> Option<(String, u64)> {
        let id = self.active_refs.get(key)?;
        let version = self.records.get(id).map(|r| r.version).unwrap_or_default();
        Some((id.clone(), version))
    }

    fn index_for(&mut self, plan_id: &str, options: &VectorStoreOptions) -> &mut HnswIndex {
        self.indexes
            .entry(plan_id.to_string())
            .or_insert_with(|| HnswIndex::new(options.dimension, options.hnsw))
    }
}

/// An in-memory store keeping records in a map with one HNSW graph per plan.
pub struct InMemoryVectorStore {
    options: VectorStoreOptions,
    state: Arc<RwLock<State>>,
}

impl InMemoryVectorStore {
    pub fn new(options: VectorStoreOptions) -> Self {
        Self {
            options,
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    /// Apply `request` if the reference still resolves to `observed`.
    /// Returns `None` when another writer got there first.
    async fn write_if_unchanged(
        &self,
        key: Option<&ReferenceKey>,
        observed: Option<(String, u64)>,
        request: &UpsertRequest,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.write().await;
        let current = key.and_then(|k| state.observe(k));
        if current != observed {
            return Ok(None);
        }

        let now = Utc::now();
        let id = match current {
            Some((id, _)) => {
                let Some(record) = state.records.get_mut(&id) else {
                    return Err(StoreError::Storage(format!("active reference points at missing record {id}")));
                };
                record.content = request.content.clone();
                record.vector = request.vector.clone();
                record.version += 1;
                record.updated_at = now;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                state.records.insert(
                    id.clone(),
                    EmbeddingRecord {
                        id: id.clone(),
                        plan_id: request.plan_id.clone(),
                        ref_type: request.ref_type.clone(),
                        ref_id: request.ref_id.clone(),
                        content: request.content.clone(),
                        vector: request.vector.clone(),
                        deletion: SoftDelete::default(),
                        version: 1,
                        created_at: now,
                        updated_at: now,
                    },
                );
                if let Some(key) = key {
                    state.active_refs.insert(key.clone(), id.clone());
                }
                id
            }
        };

        state
            .index_for(&request.plan_id, &self.options)
            .insert(&id, &request.vector)?;
        Ok(Some(id))
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new(VectorStoreOptions::default())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(&self, request: UpsertRequest) -> Result<String, StoreError> {
        check_dimension(self.options.dimension, &request.vector)?;
        let key = request.reference_key();

        for attempt in 0..=self.options.conflict_retries {
            let observed = match &key {
                Some(k) => self.state.read().await.observe(k),
                None => None,
            };
            if let Some(id) = self.write_if_unchanged(key.as_ref(), observed, &request).await? {
                debug!(id = %id, plan_id = %request.plan_id, "Upserted embedding");
                return Ok(id);
            }
            debug!(attempt, plan_id = %request.plan_id, "Upsert lost a race, re-reading");
            tokio::task::yield_now().await;
        }

        Err(StoreError::Conflict {
            plan_id: request.plan_id,
            ref_type: request.ref_type,
            ref_id: request.ref_id.unwrap_or_default(),
            attempts: self.options.conflict_retries + 1,
        })
    }

    async fn soft_delete(&self, id: &str, deleted_by: &str) -> Result<EmbeddingRecord, StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let was_active = record.is_active();
        record.deletion.mark(deleted_by, Utc::now());
        record.version += 1;
        let record = record.clone();

        if was_active {
            if let Some(key) = record.reference_key() {
                if state.active_refs.get(&key).is_some_and(|active| active == id) {
                    state.active_refs.remove(&key);
                }
            }
            if let Some(index) = state.indexes.get_mut(&record.plan_id) {
                index.remove(id);
            }
        }
        Ok(record)
    }

    async fn restore(&self, id: &str) -> Result<EmbeddingRecord, StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.is_active() {
            return Ok(record.clone());
        }

        let key = record.reference_key();
        if let Some(key) = &key {
            if let Some(active_id) = state.active_refs.get(key) {
                return Err(StoreError::DuplicateReference {
                    plan_id: key.plan_id.clone(),
                    ref_type: key.ref_type.clone(),
                    ref_id: key.ref_id.clone(),
                    active_id: active_id.clone(),
                });
            }
        }

        let Some(record) = state.records.get_mut(id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        record.deletion.clear();
        record.version += 1;
        let record = record.clone();

        if let Some(key) = key {
            state.active_refs.insert(key, id.to_string());
        }
        state
            .index_for(&record.plan_id, &self.options)
            .insert(id, &record.vector)?;
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<EmbeddingRecord>, StoreError> {
        Ok(self.state.read().await.records.get(id).cloned())
    }

    async fn query_nearest(&self, query: NearestQuery) -> Result<Vec<ScoredRecord>, StoreError> {
        check_dimension(self.options.dimension, &query.vector)?;
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let Some(index) = state.indexes.get(&query.plan_id) else {
            return Ok(Vec::new());
        };

        let scored = index
            .search(&query.vector, query.top_k, self.options.hnsw.ef_search)
            .into_iter()
            .filter_map(|(id, _)| state.records.get(&id))
            .filter(|r| r.is_active() && r.plan_id == query.plan_id)
            .map(|r| ScoredRecord {
                similarity: cosine_similarity(&r.vector, &query.vector),
                record: r.clone(),
            })
            .collect();

        Ok(vector::rank(scored, query.threshold, query.top_k))
    }

    async fn count_active(&self, plan_id: &str) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.plan_id == plan_id && r.is_active())
            .count())
    }
}
