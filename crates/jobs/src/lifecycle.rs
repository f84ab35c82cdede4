//! Job lifecycle manager.
//!
//! Every state change is a compare-and-transition against the state the
//! caller observed. When that state has moved on, the loser re-reads it
//! and gets `InvalidTransition` if its target is no longer reachable from
//! where the job now is, `Conflict` otherwise. Writes are keyed on the
//! observed retry count as well, so a job that went round the retry cycle
//! back into the same state still counts as moved.
//!
//! `Retrying -> Failed` is only taken once the retry budget is spent.

use chrono::Utc;
use planctx_config::JobsConfig;
use planctx_core::error::JobError;
use planctx_core::job::{
    JobPayload, JobRecord, JobResult, JobResultMetadata, JobState, JobStore, StateChange,
    TransitionOutcome,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Something that happened to a job, from which the next state is derived.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Prerequisites are satisfied
    Enqueue,
    /// An executor picked the job up
    Claim,
    /// The run succeeded
    Complete(JobResult),
    /// The run failed; recoverable failures are retried while budget remains
    Fail { error: String, recoverable: bool },
    /// External cancellation request
    Cancel,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Claim => "claim",
            Self::Complete(_) => "complete",
            Self::Fail { .. } => "fail",
            Self::Cancel => "cancel",
        }
    }
}

pub struct JobLifecycleManager {
    store: Arc<dyn JobStore>,
    max_retries: u32,
    conflict_retries: u32,
}

impl JobLifecycleManager {
    pub fn new(store: Arc<dyn JobStore>, config: &JobsConfig) -> Self {
        Self::with_limits(store, config.max_retries, config.conflict_retries)
    }

    pub fn with_limits(store: Arc<dyn JobStore>, max_retries: u32, conflict_retries: u32) -> Self {
        Self {
            store,
            max_retries,
            conflict_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Create a job from a queue payload. Only `Pending` and `Queued` are
    /// valid starting states.
    pub async fn submit(&self, payload: JobPayload, initial: JobState) -> Result<JobRecord, JobError> {
        match initial {
            JobState::Pending | JobState::Queued => {}
            JobState::Processing
            | JobState::Retrying
            | JobState::Completed
            | JobState::Failed
            | JobState::Cancelled => {
                return Err(JobError::InvalidInitialState {
                    job_id: payload.job_id,
                    state: initial,
                });
            }
        }

        let record = JobRecord::from_payload(payload, initial);
        self.store.insert(record.clone()).await?;
        info!(
            job_id = %record.id,
            plan_id = %record.plan_id,
            job_type = %record.job_type,
            state = %record.state,
            "Job submitted"
        );
        Ok(record)
    }

    pub async fn get(&self, job_id: &str) -> Result<JobRecord, JobError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub async fn list(&self, plan_id: &str) -> Result<Vec<JobRecord>, JobError> {
        self.store.list_by_plan(plan_id).await
    }

    /// Move `job_id` from `expected_from` to `to`.
    ///
    /// A lost race is reported, never retried.
    pub async fn transition(
        &self,
        job_id: &str,
        expected_from: JobState,
        to: JobState,
    ) -> Result<JobRecord, JobError> {
        if !expected_from.can_transition_to(to) {
            return Err(invalid(job_id, expected_from, to));
        }

        let current = self.get(job_id).await?;
        if current.state != expected_from {
            return Err(stale_error(job_id, expected_from, current.state, to));
        }

        let budget_left = current.retry_count < self.max_retries;
        let mut change = StateChange::to(to).observed(current.retry_count);
        match (expected_from, to) {
            (JobState::Processing, JobState::Retrying) if !budget_left => {
                debug!(job_id, retry_count = current.retry_count, "Retry budget exhausted");
                return Err(invalid(job_id, expected_from, to));
            }
            (JobState::Processing, JobState::Retrying) => change.increment_retry = true,
            (JobState::Retrying, JobState::Failed) if budget_left => {
                debug!(job_id, retry_count = current.retry_count, "Retry budget not yet spent");
                return Err(invalid(job_id, expected_from, to));
            }
            _ => {}
        }

        self.commit(job_id, expected_from, change).await
    }

    /// Derive the next state from `event` and apply it.
    ///
    /// `Cancel` re-reads and tries again on `Conflict`, up to the configured
    /// number of attempts, since it is valid from every open state.
    pub async fn apply(&self, job_id: &str, event: JobEvent) -> Result<JobRecord, JobError> {
        let mut attempts = 0;
        loop {
            let current = self.get(job_id).await?;
            let change = self.plan(&current, &event)?.observed(current.retry_count);
            let to = change.to;

            match self.store.compare_and_transition(job_id, current.state, change).await? {
                TransitionOutcome::Applied(record) => {
                    log_transition(&record, current.state, event.name());
                    return Ok(record);
                }
                TransitionOutcome::Stale { current: actual } => {
                    let err = stale_error(job_id, current.state, actual, to);
                    let retryable = matches!(event, JobEvent::Cancel)
                        && matches!(err, JobError::Conflict { .. });
                    if retryable && attempts < self.conflict_retries {
                        attempts += 1;
                        debug!(job_id, attempt = attempts, %actual, "Cancel raced another transition, retrying");
                        continue;
                    }
                    warn!(job_id, event = event.name(), expected = %current.state, %actual, "Lost transition race");
                    return Err(err);
                }
            }
        }
    }

    /// The write that `event` implies for a job currently in `job.state`.
    fn plan(&self, job: &JobRecord, event: &JobEvent) -> Result<StateChange, JobError> {
        use JobState::*;

        let from = job.state;
        match event {
            JobEvent::Enqueue => match from {
                Pending => Ok(StateChange::to(Queued)),
                Queued | Processing | Retrying | Completed | Failed | Cancelled => {
                    Err(invalid(&job.id, from, Queued))
                }
            },
            JobEvent::Claim => match from {
                Queued | Retrying => Ok(StateChange::to(Processing)),
                Pending | Processing | Completed | Failed | Cancelled => {
                    Err(invalid(&job.id, from, Processing))
                }
            },
            JobEvent::Complete(result) => match from {
                Processing => Ok(StateChange {
                    result: Some(result.clone()),
                    ..StateChange::to(Completed)
                }),
                Pending | Queued | Retrying | Completed | Failed | Cancelled => {
                    Err(invalid(&job.id, from, Completed))
                }
            },
            JobEvent::Fail { error, recoverable } => match from {
                Processing if *recoverable && job.retry_count < self.max_retries => Ok(StateChange {
                    increment_retry: true,
                    error: Some(error.clone()),
                    ..StateChange::to(Retrying)
                }),
                Processing => Ok(self.final_failure(job, error)),
                Retrying if job.retry_count >= self.max_retries => Ok(self.final_failure(job, error)),
                Pending | Queued | Retrying | Completed | Failed | Cancelled => {
                    Err(invalid(&job.id, from, Failed))
                }
            },
            JobEvent::Cancel => match from {
                Pending | Queued | Processing | Retrying => Ok(StateChange::to(Cancelled)),
                Completed | Failed | Cancelled => Err(invalid(&job.id, from, Cancelled)),
            },
        }
    }

    fn final_failure(&self, job: &JobRecord, error: &str) -> StateChange {
        StateChange {
            error: Some(error.to_string()),
            result: Some(failure_result(job, error)),
            ..StateChange::to(JobState::Failed)
        }
    }

    async fn commit(
        &self,
        job_id: &str,
        expected: JobState,
        change: StateChange,
    ) -> Result<JobRecord, JobError> {
        let to = change.to;
        match self.store.compare_and_transition(job_id, expected, change).await? {
            TransitionOutcome::Applied(record) => {
                log_transition(&record, expected, "transition");
                Ok(record)
            }
            TransitionOutcome::Stale { current } => {
                warn!(job_id, %expected, actual = %current, "Lost transition race");
                Err(stale_error(job_id, expected, current, to))
            }
        }
    }
}

fn invalid(job_id: &str, from: JobState, to: JobState) -> JobError {
    JobError::InvalidTransition {
        job_id: job_id.to_string(),
        from,
        to,
    }
}

fn stale_error(job_id: &str, expected: JobState, actual: JobState, to: JobState) -> JobError {
    if actual.can_transition_to(to) {
        JobError::Conflict {
            job_id: job_id.to_string(),
            expected,
            actual,
        }
    } else {
        invalid(job_id, actual, to)
    }
}

fn failure_result(job: &JobRecord, error: &str) -> JobResult {
    JobResult {
        success: false,
        job_type: job.job_type.clone(),
        data: serde_json::Value::Null,
        summary: error.to_string(),
        metadata: JobResultMetadata {
            created_at: Utc::now(),
            model: None,
            tokens_used: 0,
        },
    }
}

fn log_transition(record: &JobRecord, from: JobState, cause: &str) {
    info!(
        job_id = %record.id,
        %from,
        to = %record.state,
        retry_count = record.retry_count,
        cause,
        "Job transition"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryJobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager(max_retries: u32) -> JobLifecycleManager {
        JobLifecycleManager::with_limits(Arc::new(InMemoryJobStore::new()), max_retries, 3)
    }

    fn payload(id: &str) -> JobPayload {
        JobPayload {
            job_id: id.into(),
            plan_id: "plan".into(),
            user_id: "user".into(),
            job_type: "summarize".into(),
            params: serde_json::Map::new(),
        }
    }

    fn success() -> JobResult {
        JobResult {
            success: true,
            job_type: "summarize".into(),
            data: serde_json::json!({"summary": "done"}),
            summary: "done".into(),
            metadata: JobResultMetadata {
                created_at: Utc::now(),
                model: Some("test-model".into()),
                tokens_used: 42,
            },
        }
    }

    #[tokio::test]
    async fn retry_cycle_then_late_completion_rejected() {
        use JobState::*;
        let jobs = manager(3);
        jobs.submit(payload("j1"), Pending).await.unwrap();

        for (from, to) in [
            (Pending, Queued),
            (Queued, Processing),
            (Processing, Retrying),
            (Retrying, Processing),
            (Processing, Completed),
        ] {
            let record = jobs.transition("j1", from, to).await.unwrap();
            assert_eq!(record.state, to);
        }
        assert_eq!(jobs.get("j1").await.unwrap().retry_count, 1);

        let late = jobs.transition("j1", Processing, Completed).await;
        assert!(matches!(
            late,
            Err(JobError::InvalidTransition { from: Completed, to: Completed, .. })
        ));
    }

    #[tokio::test]
    async fn submit_rejects_non_initial_states() {
        let jobs = manager(3);
        let err = jobs.submit(payload("j1"), JobState::Processing).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidInitialState { state: JobState::Processing, .. }));
        assert!(matches!(jobs.get("j1").await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_edge_rejected_before_reading() {
        let jobs = manager(3);
        let err = jobs
            .transition("missing", JobState::Pending, JobState::Processing)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn stale_expectation_with_valid_edge_is_conflict() {
        let jobs = manager(3);
        jobs.submit(payload("j1"), JobState::Queued).await.unwrap();
        jobs.apply("j1", JobEvent::Claim).await.unwrap();

        // Cancel is still valid from Processing, so the caller just lost a race.
        let err = jobs
            .transition("j1", JobState::Queued, JobState::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Conflict { expected: JobState::Queued, actual: JobState::Processing, .. }
        ));
    }

    #[tokio::test]
    async fn explicit_retry_respects_budget() {
        let jobs = manager(1);
        jobs.submit(payload("j1"), JobState::Queued).await.unwrap();
        jobs.transition("j1", JobState::Queued, JobState::Processing).await.unwrap();
        jobs.transition("j1", JobState::Processing, JobState::Retrying).await.unwrap();
        jobs.transition("j1", JobState::Retrying, JobState::Processing).await.unwrap();

        let err = jobs
            .transition("j1", JobState::Processing, JobState::Retrying)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_eq!(jobs.get("j1").await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn recoverable_failures_exhaust_into_failed() {
        let jobs = manager(2);
        jobs.submit(payload("j1"), JobState::Queued).await.unwrap();

        let fail = || JobEvent::Fail {
            error: "upstream timeout".into(),
            recoverable: true,
        };

        for expected_retries in 1..=2 {
            jobs.apply("j1", JobEvent::Claim).await.unwrap();
            let record = jobs.apply("j1", fail()).await.unwrap();
            assert_eq!(record.state, JobState::Retrying);
            assert_eq!(record.retry_count, expected_retries);
        }

        jobs.apply("j1", JobEvent::Claim).await.unwrap();
        let record = jobs.apply("j1", fail()).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.retry_count, 2);
        let result = record.result.unwrap();
        assert!(!result.success);
        assert_eq!(result.summary, "upstream timeout");
    }

    #[tokio::test]
    async fn fatal_failure_skips_retry() {
        let jobs = manager(3);
        jobs.submit(payload("j1"), JobState::Queued).await.unwrap();
        jobs.apply("j1", JobEvent::Claim).await.unwrap();

        let record = jobs
            .apply(
                "j1",
                JobEvent::Fail {
                    error: "bad params".into(),
                    recoverable: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn complete_stores_result() {
        let jobs = manager(3);
        jobs.submit(payload("j1"), JobState::Queued).await.unwrap();
        jobs.apply("j1", JobEvent::Claim).await.unwrap();

        let record = jobs.apply("j1", JobEvent::Complete(success())).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.result.unwrap().metadata.tokens_used, 42);
    }

    #[tokio::test]
    async fn terminal_jobs_reject_every_event() {
        let jobs = manager(3);
        jobs.submit(payload("j1"), JobState::Pending).await.unwrap();
        jobs.apply("j1", JobEvent::Cancel).await.unwrap();

        for event in [
            JobEvent::Enqueue,
            JobEvent::Claim,
            JobEvent::Complete(success()),
            JobEvent::Fail {
                error: "x".into(),
                recoverable: true,
            },
            JobEvent::Cancel,
        ] {
            let name = event.name();
            let err = jobs.apply("j1", event).await.unwrap_err();
            assert!(
                matches!(err, JobError::InvalidTransition { from: JobState::Cancelled, .. }),
                "{name} accepted on a cancelled job"
            );
        }
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let jobs = Arc::new(manager(3));
        jobs.submit(payload("j1"), JobState::Queued).await.unwrap();

        let claims = (0..16).map(|_| {
            let jobs = jobs.clone();
            tokio::spawn(async move { jobs.apply("j1", JobEvent::Claim).await })
        });
        let results = futures::future::join_all(claims).await;

        let winners = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(winners, 1);
        for result in results.into_iter().map(|r| r.unwrap()) {
            if let Err(err) = result {
                assert!(matches!(err, JobError::InvalidTransition { .. }), "{err}");
            }
        }
        assert_eq!(jobs.get("j1").await.unwrap().state, JobState::Processing);
    }

    /// Runs a job through one `Processing -> Retrying -> Processing` cycle
    /// right after the next read returns, so the reader's snapshot has the
    /// right state but a stale retry count.
    struct RecyclingStore {
        inner: InMemoryJobStore,
        armed: AtomicBool,
    }

    #[async_trait]
    impl JobStore for RecyclingStore {
        fn name(&self) -> &str {
            "recycling"
        }

        async fn insert(&self, job: JobRecord) -> Result<(), JobError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobError> {
            let snapshot = self.inner.get(id).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                let retry = StateChange {
                    increment_retry: true,
                    ..StateChange::to(JobState::Retrying)
                };
                self.inner.compare_and_transition(id, JobState::Processing, retry).await?;
                self.inner
                    .compare_and_transition(id, JobState::Retrying, StateChange::to(JobState::Processing))
                    .await?;
            }
            Ok(snapshot)
        }

        async fn list_by_plan(&self, plan_id: &str) -> Result<Vec<JobRecord>, JobError> {
            self.inner.list_by_plan(plan_id).await
        }

        async fn compare_and_transition(
            &self,
            id: &str,
            expected: JobState,
            change: StateChange,
        ) -> Result<TransitionOutcome, JobError> {
            self.inner.compare_and_transition(id, expected, change).await
        }
    }

    async fn recycling_manager(max_retries: u32) -> (Arc<RecyclingStore>, JobLifecycleManager) {
        let store = Arc::new(RecyclingStore {
            inner: InMemoryJobStore::new(),
            armed: AtomicBool::new(false),
        });
        let jobs = JobLifecycleManager::with_limits(store.clone(), max_retries, 3);
        jobs.submit(payload("j1"), JobState::Queued).await.unwrap();
        jobs.apply("j1", JobEvent::Claim).await.unwrap();
        (store, jobs)
    }

    #[tokio::test]
    async fn retry_after_hidden_retry_cycle_is_conflict() {
        let (store, jobs) = recycling_manager(1).await;

        store.armed.store(true, Ordering::SeqCst);
        let err = jobs
            .transition("j1", JobState::Processing, JobState::Retrying)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Conflict { .. }), "{err}");

        let record = jobs.get("j1").await.unwrap();
        assert_eq!(record.state, JobState::Processing);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn recoverable_failure_after_hidden_retry_cycle_keeps_budget() {
        let (store, jobs) = recycling_manager(1).await;

        store.armed.store(true, Ordering::SeqCst);
        let fail = JobEvent::Fail {
            error: "upstream timeout".into(),
            recoverable: true,
        };
        let err = jobs.apply("j1", fail.clone()).await.unwrap_err();
        assert!(matches!(err, JobError::Conflict { .. }), "{err}");
        assert_eq!(jobs.get("j1").await.unwrap().retry_count, 1);

        // Re-read sees the spent budget and fails for good.
        let record = jobs.apply("j1", fail).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn retrying_fails_only_once_budget_is_spent() {
        let jobs = manager(1);
        jobs.submit(payload("j1"), JobState::Queued).await.unwrap();
        jobs.transition("j1", JobState::Queued, JobState::Processing).await.unwrap();

        // Reaching Retrying spends the only retry, so it may now fail.
        jobs.transition("j1", JobState::Processing, JobState::Retrying).await.unwrap();
        let record = jobs.transition("j1", JobState::Retrying, JobState::Failed).await.unwrap();
        assert_eq!(record.state, JobState::Failed);

        let jobs = manager(3);
        jobs.submit(payload("j2"), JobState::Queued).await.unwrap();
        jobs.apply("j2", JobEvent::Claim).await.unwrap();
        jobs.transition("j2", JobState::Processing, JobState::Retrying).await.unwrap();

        let err = jobs
            .transition("j2", JobState::Retrying, JobState::Failed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidTransition { from: JobState::Retrying, to: JobState::Failed, .. }
        ));
        let err = jobs
            .apply(
                "j2",
                JobEvent::Fail {
                    error: "bad params".into(),
                    recoverable: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { from: JobState::Retrying, .. }));
        assert_eq!(jobs.get("j2").await.unwrap().state, JobState::Retrying);
    }

    #[tokio::test]
    async fn list_returns_plan_jobs() {
        let jobs = manager(3);
        jobs.submit(payload("a"), JobState::Queued).await.unwrap();
        jobs.submit(payload("b"), JobState::Pending).await.unwrap();

        let listed = jobs.list("plan").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(jobs.list("other").await.unwrap().is_empty());
    }
}
