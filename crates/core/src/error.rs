//! Error types for the planctx domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use crate::job::JobState;
use thiserror::Error;

/// The top-level error type for all planctx operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Vector store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Job lifecycle errors ---
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    // --- Collaborator errors ---
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Embedding not found: {0}")]
    NotFound(String),

    /// A concurrent writer won every attempt; the caller should re-read and retry.
    #[error("Write conflict on ({plan_id}, {ref_type}, {ref_id}) after {attempts} attempts")]
    Conflict {
        plan_id: String,
        ref_type: String,
        ref_id: String,
        attempts: u32,
    },

    #[error("Reference ({plan_id}, {ref_type}, {ref_id}) is already held by active record {active_id}")]
    DuplicateReference {
        plan_id: String,
        ref_type: String,
        ref_id: String,
        active_id: String,
    },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Job {job_id} cannot be created in state {state}")]
    InvalidInitialState { job_id: String, state: JobState },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    /// The job moved away from `expected` before the conditional update landed.
    #[error("Job {job_id} changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        job_id: String,
        expected: JobState,
        actual: JobState,
    },

    #[error("Job storage unavailable: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable { collaborator: String, reason: String },

    #[error("{collaborator} timed out after {timeout_ms}ms")]
    Timeout { collaborator: String, timeout_ms: u64 },
}

impl UpstreamError {
    pub fn unavailable(collaborator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            collaborator: collaborator.into(),
            reason: reason.into(),
        }
    }
}
