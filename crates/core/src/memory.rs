//! Vector store trait: embedded content fragments with similarity search.
//!
//! The store owns the per-reference uniqueness invariant: among active
//! records, at most one exists per `(plan_id, ref_type, ref_id)`.
//! Soft-deleted records are invisible to that check and to retrieval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::StoreError;

/// Default embedding dimensionality.
pub const DEFAULT_DIMENSION: usize = 1536;

/// Soft-deletion metadata, embedded by composition in any entity that
/// supports delete/restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDelete {
    pub is_deleted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl SoftDelete {
    /// Mark as deleted by `actor` at `at`.
    pub fn mark(&mut self, actor: impl Into<String>, at: DateTime<Utc>) {
        self.is_deleted = true;
        self.deleted_at = Some(at);
        self.deleted_by = Some(actor.into());
    }

    /// Clear the flag and all deletion metadata.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }
}

/// A stored content fragment with its embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Opaque record id
    pub id: String,

    /// Owning plan
    pub plan_id: String,

    /// Kind of the referenced entity (e.g. "task", "note", "message")
    pub ref_type: String,

    /// Id of the referenced entity; `None` for free-standing fragments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,

    /// The embedded text
    pub content: String,

    /// Embedding vector
    #[serde(default)]
    pub vector: Vec<f32>,

    /// Deletion state
    #[serde(default)]
    pub deletion: SoftDelete,

    /// Optimistic concurrency token, bumped on every write
    #[serde(default)]
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn is_active(&self) -> bool {
        self.deletion.is_active()
    }

    /// The uniqueness key, if this record participates in the invariant.
    pub fn reference_key(&self) -> Option<ReferenceKey> {
        self.ref_id.as_ref().map(|ref_id| ReferenceKey {
            plan_id: self.plan_id.clone(),
            ref_type: self.ref_type.clone(),
            ref_id: ref_id.clone(),
        })
    }
}

/// `(plan_id, ref_type, ref_id)`: the scope of the active-record uniqueness invariant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceKey {
    pub plan_id: String,
    pub ref_type: String,
    pub ref_id: String,
}

/// Input to [`VectorStore::upsert`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertRequest {
    pub plan_id: String,
    pub ref_type: String,
    #[serde(default)]
    pub ref_id: Option<String>,
    pub content: String,
    pub vector: Vec<f32>,
}

impl UpsertRequest {
    pub fn reference_key(&self) -> Option<ReferenceKey> {
        self.ref_id.as_ref().map(|ref_id| ReferenceKey {
            plan_id: self.plan_id.clone(),
            ref_type: self.ref_type.clone(),
            ref_id: ref_id.clone(),
        })
    }
}

/// A nearest-neighbour query scoped to one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearestQuery {
    pub plan_id: String,
    pub vector: Vec<f32>,

    /// Maximum number of results
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum cosine similarity
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

fn default_top_k() -> usize {
    10
}

fn default_threshold() -> f32 {
    0.7
}

/// A record paired with its cosine similarity to the query vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: EmbeddingRecord,
    pub similarity: f32,
}

/// The core VectorStore trait.
///
/// Implementations: SQLite, in-memory (for testing), none (no-op).
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory", "none").
    fn name(&self) -> &str;

    /// Insert, or update in place the active record for the same reference.
    /// Returns the id of the surviving record.
    async fn upsert(&self, request: UpsertRequest) -> Result<String, StoreError>;

    /// Flag a record as deleted by `deleted_by`.
    async fn soft_delete(&self, id: &str, deleted_by: &str) -> Result<EmbeddingRecord, StoreError>;

    /// Clear the deletion flag and metadata.
    async fn restore(&self, id: &str) -> Result<EmbeddingRecord, StoreError>;

    /// Get a record by id, deleted or not.
    async fn get(&self, id: &str) -> Result<Option<EmbeddingRecord>, StoreError>;

    /// Active records of a plan most similar to the query vector, best first.
    async fn query_nearest(&self, query: NearestQuery) -> Result<Vec<ScoredRecord>, StoreError>;

    /// Number of active records in a plan.
    async fn count_active(&self, plan_id: &str) -> Result<usize, StoreError>;
}
