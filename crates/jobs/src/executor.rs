//! Job executor: claims jobs and runs their handlers.
//!
//! A handler is looked up by `job_type` and run under a deadline. Its
//! outcome is reported back through the lifecycle manager as `Complete`
//! or `Fail`. A job cancelled while its handler ran stays cancelled.
//! Storage errors while recording the outcome are retried with a linear
//! backoff, so a finished run is not stranded in `Processing` by one
//! locked write.

use async_trait::async_trait;
use chrono::Utc;
use planctx_config::JobsConfig;
use planctx_core::error::JobError;
use planctx_core::job::{JobRecord, JobResult, JobResultMetadata, JobState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lifecycle::{JobEvent, JobLifecycleManager};

#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Worth another attempt (rate limits, upstream outages)
    #[error("recoverable: {0}")]
    Recoverable(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

/// What a handler hands back on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOutput {
    #[serde(default)]
    pub data: serde_json::Value,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
}

/// Runs one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The `job_type` this handler serves.
    fn job_type(&self) -> &str;

    async fn handle(&self, job: &JobRecord) -> Result<JobOutput, HandlerError>;
}

pub struct JobExecutor {
    lifecycle: Arc<JobLifecycleManager>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    timeout: Duration,
    report_retries: u32,
    report_backoff: Duration,
}

const DEFAULT_REPORT_RETRIES: u32 = 3;
const DEFAULT_REPORT_BACKOFF: Duration = Duration::from_millis(50);

impl JobExecutor {
    pub fn new(lifecycle: Arc<JobLifecycleManager>, timeout: Duration) -> Self {
        Self {
            lifecycle,
            handlers: HashMap::new(),
            timeout,
            report_retries: DEFAULT_REPORT_RETRIES,
            report_backoff: DEFAULT_REPORT_BACKOFF,
        }
    }

    pub fn from_config(lifecycle: Arc<JobLifecycleManager>, config: &JobsConfig) -> Self {
        Self::new(lifecycle, Duration::from_secs(config.handler_timeout_secs))
            .with_report_retries(config.report_retries, DEFAULT_REPORT_BACKOFF)
    }

    /// Attempts beyond the first at recording an outcome, and the base
    /// delay between them.
    pub fn with_report_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.report_retries = retries;
        self.report_backoff = backoff;
        self
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        debug!(job_type = handler.job_type(), "Registered job handler");
        self.handlers.insert(handler.job_type().to_string(), handler);
    }

    pub fn handler_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Claim `job_id`, run its handler once and record the outcome.
    pub async fn run(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let job = self.lifecycle.apply(job_id, JobEvent::Claim).await?;

        let event = match self.handlers.get(&job.job_type) {
            Some(handler) => self.execute(handler.as_ref(), &job).await,
            None => JobEvent::Fail {
                error: format!("no handler registered for job type '{}'", job.job_type),
                recoverable: false,
            },
        };

        self.report(job_id, event).await
    }

    /// Run `job_id` until it leaves the retry cycle.
    pub async fn run_until_settled(&self, job_id: &str) -> Result<JobRecord, JobError> {
        loop {
            let record = self.run(job_id).await?;
            match record.state {
                JobState::Retrying => {
                    debug!(job_id, retry_count = record.retry_count, "Re-running job");
                }
                JobState::Pending
                | JobState::Queued
                | JobState::Processing
                | JobState::Completed
                | JobState::Failed
                | JobState::Cancelled => return Ok(record),
            }
        }
    }

    async fn execute(&self, handler: &dyn JobHandler, job: &JobRecord) -> JobEvent {
        match tokio::time::timeout(self.timeout, handler.handle(job)).await {
            Ok(Ok(output)) => JobEvent::Complete(JobResult {
                success: true,
                job_type: job.job_type.clone(),
                data: output.data,
                summary: output.summary,
                metadata: JobResultMetadata {
                    created_at: Utc::now(),
                    model: output.model,
                    tokens_used: output.tokens_used,
                },
            }),
            Ok(Err(HandlerError::Recoverable(error))) => JobEvent::Fail {
                error,
                recoverable: true,
            },
            Ok(Err(HandlerError::Fatal(error))) => JobEvent::Fail {
                error,
                recoverable: false,
            },
            Err(_) => JobEvent::Fail {
                error: format!("handler timed out after {}s", self.timeout.as_secs()),
                recoverable: true,
            },
        }
    }

    async fn report(&self, job_id: &str, event: JobEvent) -> Result<JobRecord, JobError> {
        let mut attempt = 0;
        let outcome = loop {
            match self.lifecycle.apply(job_id, event.clone()).await {
                Err(JobError::Storage(reason)) if attempt < self.report_retries => {
                    attempt += 1;
                    warn!(job_id, attempt, %reason, "Recording job outcome failed, retrying");
                    tokio::time::sleep(self.report_backoff * attempt).await;
                }
                other => break other,
            }
        };

        match outcome {
            Ok(record) => {
                info!(job_id, state = %record.state, "Job run finished");
                Ok(record)
            }
            Err(JobError::InvalidTransition { .. } | JobError::Conflict { .. }) => {
                let current = self.lifecycle.get(job_id).await?;
                warn!(job_id, state = %current.state, "Job moved while its handler ran, outcome dropped");
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }
}
