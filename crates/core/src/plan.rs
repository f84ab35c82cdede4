//! Plan metadata: the task/job summaries that make up a plan's state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::job::JobRecord;

/// One entry of plan metadata offered to the context builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub id: String,

    /// Short label (job type, task title, ...)
    pub title: String,

    /// Detail text
    #[serde(default)]
    pub content: String,

    /// Whether the entry is still in flight
    #[serde(default)]
    pub active: bool,

    pub updated_at: DateTime<Utc>,
}

impl PlanEntry {
    /// Text rendered into the context.
    pub fn render(&self) -> String {
        let marker = if self.active { "active" } else { "done" };
        if self.content.is_empty() {
            format!("[{marker}] {}", self.title)
        } else {
            format!("[{marker}] {}: {}", self.title, self.content)
        }
    }
}

impl From<&JobRecord> for PlanEntry {
    fn from(job: &JobRecord) -> Self {
        let content = match (&job.result, &job.error) {
            (Some(result), _) => result.summary.clone(),
            (None, Some(error)) => format!("{} ({error})", job.state),
            (None, None) => job.state.to_string(),
        };
        Self {
            id: job.id.clone(),
            title: job.job_type.clone(),
            content,
            active: job.state.is_open(),
            updated_at: job.updated_at,
        }
    }
}
