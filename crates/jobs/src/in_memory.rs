//! In-memory job store: useful for testing and single-process runs.

use async_trait::async_trait;
use chrono::Utc;
use planctx_core::error::JobError;
use planctx_core::job::{JobRecord, JobState, JobStore, StateChange, TransitionOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn name(&self) -> &str { "in_memory" }

    async fn insert(&self, job: JobRecord) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobError::AlreadyExists(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list_by_plan(&self, plan_id: &str) -> Result<Vec<JobRecord>, JobError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<JobRecord> = jobs
            .values()
            .filter(|j| j.plan_id == plan_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn compare_and_transition(
        &self,
        id: &str,
        expected: JobState,
        change: StateChange,
    ) -> Result<TransitionOutcome, JobError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if !change.matches(expected, job.state, job.retry_count) {
            return Ok(TransitionOutcome::Stale { current: job.state });
        }

        job.state = change.to;
        if change.increment_retry {
            job.retry_count += 1;
        }
        if let Some(error) = change.error {
            job.error = Some(error);
        }
        if let Some(result) = change.result {
            job.result = Some(result);
        }
        job.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied(job.clone()))
    }
}
