//! Job domain model: asynchronous units of work and their state machine.
//!
//! State changes are only ever applied as compare-and-transition updates
//! keyed on the previously observed state, so two executors racing on the
//! same job cannot both claim or complete it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::JobError;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created, prerequisites not yet satisfied
    Pending,
    /// Ready to be claimed by an executor
    Queued,
    /// Claimed and running
    Processing,
    /// Failed recoverably, waiting to be re-claimed
    Retrying,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Cancelled by an external request
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        Self::Pending,
        Self::Queued,
        Self::Processing,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Retrying => "RETRYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// No transition is defined out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed | Self::Failed | Self::Cancelled => true,
            Self::Pending | Self::Queued | Self::Processing | Self::Retrying => false,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        match self {
            Pending => matches!(to, Queued | Cancelled),
            Queued => matches!(to, Processing | Cancelled),
            Processing => matches!(to, Completed | Failed | Retrying | Cancelled),
            Retrying => matches!(to, Processing | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "RETRYING" => Ok(Self::Retrying),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" | "CANCELED" => Ok(Self::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Job payload as delivered by the external queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: String,
    pub plan_id: String,
    pub user_id: String,
    pub job_type: String,

    /// Opaque, job-type specific parameters
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Metadata attached to every job result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultMetadata {
    pub created_at: DateTime<Utc>,

    /// Model that produced the result, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub tokens_used: u64,
}

/// Job result as produced back to the external queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub job_type: String,

    #[serde(default)]
    pub data: serde_json::Value,

    /// Human-readable summary
    pub summary: String,

    pub metadata: JobResultMetadata,
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub plan_id: String,
    pub user_id: String,
    pub job_type: String,

    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,

    pub state: JobState,

    #[serde(default)]
    pub retry_count: u32,

    /// Last reported error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Result of a completed (or finally failed) run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build a fresh record from a queue payload.
    pub fn from_payload(payload: JobPayload, state: JobState) -> Self {
        let now = Utc::now();
        Self {
            id: payload.job_id,
            plan_id: payload.plan_id,
            user_id: payload.user_id,
            job_type: payload.job_type,
            params: payload.params,
            state,
            retry_count: 0,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn payload(&self) -> JobPayload {
        JobPayload {
            job_id: self.id.clone(),
            plan_id: self.plan_id.clone(),
            user_id: self.user_id.clone(),
            job_type: self.job_type.clone(),
            params: self.params.clone(),
        }
    }
}

/// The values written by a conditional transition.
///
/// `None` for `error` or `result` leaves the stored value in place.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub to: JobState,
    /// Bump `retry_count` by one as part of the same write
    pub increment_retry: bool,
    pub error: Option<String>,
    pub result: Option<JobResult>,
    /// Also require the stored `retry_count` to equal this value.
    /// A job can cycle back to the same state between a read and a write;
    /// its retry count never goes back.
    pub expected_retry_count: Option<u32>,
}

impl StateChange {
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            increment_retry: false,
            error: None,
            result: None,
            expected_retry_count: None,
        }
    }

    /// Key the write on the retry count observed alongside the state.
    pub fn observed(mut self, retry_count: u32) -> Self {
        self.expected_retry_count = Some(retry_count);
        self
    }

    /// Whether a stored `(state, retry_count)` satisfies this change's expectation.
    pub fn matches(&self, expected: JobState, state: JobState, retry_count: u32) -> bool {
        state == expected && self.expected_retry_count.is_none_or(|n| n == retry_count)
    }
}

/// Outcome of [`JobStore::compare_and_transition`].
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The stored state matched and the change was written.
    Applied(JobRecord),
    /// The stored state no longer matched; nothing was written.
    Stale { current: JobState },
}

/// Persistence for job records.
///
/// Implementations: SQLite, in-memory.
#[async_trait]
pub trait JobStore: Send + Sync {
    fn name(&self) -> &str;

    /// Persist a new job. Fails with `AlreadyExists` on a duplicate id.
    async fn insert(&self, job: JobRecord) -> Result<(), JobError>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobError>;

    /// Jobs of a plan, oldest first.
    async fn list_by_plan(&self, plan_id: &str) -> Result<Vec<JobRecord>, JobError>;

    /// Write `change` only if the stored state still equals `expected` and,
    /// when `change.expected_retry_count` is set, the retry count is unchanged.
    async fn compare_and_transition(
        &self,
        id: &str,
        expected: JobState,
        change: StateChange,
    ) -> Result<TransitionOutcome, JobError>;
}
