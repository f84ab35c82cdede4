//! SQLite job store.
//!
//! State changes are a single `UPDATE .. WHERE id = ? AND state = ?`
//! (plus `AND retry_count = ?` when the change carries the observed count),
//! so the row only moves if nobody else moved it since the caller read it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use planctx_core::error::JobError;
use planctx_core::job::{JobRecord, JobResult, JobState, JobStore, StateChange, TransitionOutcome};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the job database at `path`.
    pub async fn new(path: &str) -> Result<Self, JobError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| JobError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Every connection to an in-memory database sees its own empty copy.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| JobError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite job store initialized at {path}");
        Ok(store)
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, JobError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), JobError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id          TEXT PRIMARY KEY NOT NULL,
                plan_id     TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                job_type    TEXT NOT NULL,
                params      TEXT NOT NULL DEFAULT '{}',
                state       TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error       TEXT,
                result      TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobError::Storage(format!("jobs table: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_plan ON jobs(plan_id, created_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| JobError::Storage(format!("plan index: {e}")))?;

        debug!("Job store migrations complete");
        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord, JobError> {
        let column = |name: &str, e: sqlx::Error| JobError::Storage(format!("{name} column: {e}"));

        let params_json: String = row.try_get("params").map_err(|e| column("params", e))?;
        let state: String = row.try_get("state").map_err(|e| column("state", e))?;
        let retry_count: i64 = row.try_get("retry_count").map_err(|e| column("retry_count", e))?;
        let result_json: Option<String> = row.try_get("result").map_err(|e| column("result", e))?;
        let created_at: String = row.try_get("created_at").map_err(|e| column("created_at", e))?;
        let updated_at: String = row.try_get("updated_at").map_err(|e| column("updated_at", e))?;

        let result: Option<JobResult> = result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| JobError::Storage(format!("result column: {e}")))?;

        Ok(JobRecord {
            id: row.try_get("id").map_err(|e| column("id", e))?,
            plan_id: row.try_get("plan_id").map_err(|e| column("plan_id", e))?,
            user_id: row.try_get("user_id").map_err(|e| column("user_id", e))?,
            job_type: row.try_get("job_type").map_err(|e| column("job_type", e))?,
            params: serde_json::from_str(&params_json)
                .map_err(|e| JobError::Storage(format!("params column: {e}")))?,
            state: state.parse().map_err(JobError::Storage)?,
            retry_count: retry_count as u32,
            error: row.try_get("error").map_err(|e| column("error", e))?,
            result,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    async fn current_state(&self, id: &str) -> Result<Option<JobState>, JobError> {
        let row = sqlx::query("SELECT state FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobError::Storage(format!("state lookup: {e}")))?;

        match row {
            Some(r) => {
                let state: String = r
                    .try_get("state")
                    .map_err(|e| JobError::Storage(format!("state column: {e}")))?;
                Ok(Some(state.parse().map_err(JobError::Storage)?))
            }
            None => Ok(None),
        }
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, JobError> {
    serde_json::to_string(value).map_err(|e| JobError::Storage(format!("serialization: {e}")))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert(&self, job: JobRecord) -> Result<(), JobError> {
        let result_json = job.result.as_ref().map(to_json).transpose()?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, plan_id, user_id, job_type, params, state, retry_count, error, result, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&job.id)
        .bind(&job.plan_id)
        .bind(&job.user_id)
        .bind(&job.job_type)
        .bind(to_json(&job.params)?)
        .bind(job.state.as_str())
        .bind(job.retry_count as i64)
        .bind(&job.error)
        .bind(result_json)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(JobError::AlreadyExists(job.id))
            }
            Err(e) => Err(JobError::Storage(format!("INSERT failed: {e}"))),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobError::Storage(format!("GET by ID: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_job(r)?)),
            None => Ok(None),
        }
    }

    async fn list_by_plan(&self, plan_id: &str) -> Result<Vec<JobRecord>, JobError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE plan_id = ?1 ORDER BY created_at, id")
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JobError::Storage(format!("list by plan: {e}")))?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn compare_and_transition(
        &self,
        id: &str,
        expected: JobState,
        change: StateChange,
    ) -> Result<TransitionOutcome, JobError> {
        let result_json = change.result.as_ref().map(to_json).transpose()?;

        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                state = ?1,
                retry_count = retry_count + ?2,
                error = COALESCE(?3, error),
                result = COALESCE(?4, result),
                updated_at = ?5
            WHERE id = ?6 AND state = ?7 AND (?8 IS NULL OR retry_count = ?8)
            RETURNING *
            "#,
        )
        .bind(change.to.as_str())
        .bind(if change.increment_retry { 1i64 } else { 0 })
        .bind(&change.error)
        .bind(result_json)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(expected.as_str())
        .bind(change.expected_retry_count.map(i64::from))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| JobError::Storage(format!("transition: {e}")))?;

        if let Some(ref r) = row {
            return Ok(TransitionOutcome::Applied(Self::row_to_job(r)?));
        }

        match self.current_state(id).await? {
            Some(current) => Ok(TransitionOutcome::Stale { current }),
            None => Err(JobError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planctx_core::job::{JobPayload, JobResultMetadata};

    async fn test_store() -> SqliteJobStore {
        SqliteJobStore::new("sqlite::memory:").await.unwrap()
    }

    fn job(id: &str) -> JobRecord {
        let mut params = serde_json::Map::new();
        params.insert("query".into(), serde_json::json!("deploy schedule"));
        JobRecord::from_payload(
            JobPayload {
                job_id: id.into(),
                plan_id: "plan".into(),
                user_id: "user".into(),
                job_type: "context.build".into(),
                params,
            },
            JobState::Pending,
        )
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = test_store().await;
        store.insert(job("j1")).await.unwrap();

        let loaded = store.get("j1").await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Pending);
        assert_eq!(loaded.job_type, "context.build");
        assert_eq!(loaded.params["query"], "deploy schedule");
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let store = test_store().await;
        store.insert(job("j1")).await.unwrap();
        assert!(matches!(store.insert(job("j1")).await, Err(JobError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn conditional_update_applies_once() {
        let store = test_store().await;
        store.insert(job("j1")).await.unwrap();

        let first = store
            .compare_and_transition("j1", JobState::Pending, StateChange::to(JobState::Queued))
            .await
            .unwrap();
        assert!(matches!(first, TransitionOutcome::Applied(ref r) if r.state == JobState::Queued));

        let second = store
            .compare_and_transition("j1", JobState::Pending, StateChange::to(JobState::Queued))
            .await
            .unwrap();
        assert!(matches!(second, TransitionOutcome::Stale { current: JobState::Queued }));
    }

    #[tokio::test]
    async fn result_and_retry_persist() {
        let store = test_store().await;
        store.insert(job("j1")).await.unwrap();
        for (from, to) in [
            (JobState::Pending, JobState::Queued),
            (JobState::Queued, JobState::Processing),
        ] {
            store.compare_and_transition("j1", from, StateChange::to(to)).await.unwrap();
        }
        store
            .compare_and_transition(
                "j1",
                JobState::Processing,
                StateChange {
                    increment_retry: true,
                    error: Some("upstream 503".into()),
                    ..StateChange::to(JobState::Retrying)
                }
                .observed(0),
            )
            .await
            .unwrap();
        store
            .compare_and_transition("j1", JobState::Retrying, StateChange::to(JobState::Processing))
            .await
            .unwrap();

        let result = JobResult {
            success: true,
            job_type: "context.build".into(),
            data: serde_json::json!({"tokens": 812}),
            summary: "built".into(),
            metadata: JobResultMetadata {
                created_at: Utc::now(),
                model: None,
                tokens_used: 812,
            },
        };
        store
            .compare_and_transition(
                "j1",
                JobState::Processing,
                StateChange {
                    result: Some(result),
                    ..StateChange::to(JobState::Completed)
                },
            )
            .await
            .unwrap();

        let loaded = store.get("j1").await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Completed);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.error.as_deref(), Some("upstream 503"));
        assert_eq!(loaded.result.unwrap().metadata.tokens_used, 812);
    }

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.sqlite").display());

        {
            let store = SqliteJobStore::new(&url).await.unwrap();
            store.insert(job("j1")).await.unwrap();
            store
                .compare_and_transition("j1", JobState::Pending, StateChange::to(JobState::Queued))
                .await
                .unwrap();
        }

        let reopened = SqliteJobStore::new(&url).await.unwrap();
        let listed = reopened.list_by_plan("plan").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, JobState::Queued);
    }

    #[tokio::test]
    async fn retry_count_guard_rejects_recycled_state() {
        let store = test_store().await;
        store.insert(job("j1")).await.unwrap();
        for (from, to) in [
            (JobState::Pending, JobState::Queued),
            (JobState::Queued, JobState::Processing),
        ] {
            store.compare_and_transition("j1", from, StateChange::to(to)).await.unwrap();
        }
        let retry = || StateChange {
            increment_retry: true,
            ..StateChange::to(JobState::Retrying)
        };
        store
            .compare_and_transition("j1", JobState::Processing, retry().observed(0))
            .await
            .unwrap();
        store
            .compare_and_transition("j1", JobState::Retrying, StateChange::to(JobState::Processing))
            .await
            .unwrap();

        // Same state as first observed, but a retry happened in between.
        let outcome = store
            .compare_and_transition("j1", JobState::Processing, retry().observed(0))
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Stale { current: JobState::Processing }));
        assert_eq!(store.get("j1").await.unwrap().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn corrupt_params_column_is_reported() {
        let store = test_store().await;
        store.insert(job("j1")).await.unwrap();
        sqlx::query("UPDATE jobs SET params = 'not json' WHERE id = 'j1'")
            .execute(&store.pool)
            .await
            .unwrap();

        match store.get("j1").await {
            Err(JobError::Storage(msg)) => assert!(msg.contains("params column")),
            other => panic!("expected a storage error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = test_store().await;
        let outcome = store
            .compare_and_transition("nope", JobState::Queued, StateChange::to(JobState::Processing))
            .await;
        assert!(matches!(outcome, Err(JobError::NotFound(_))));
    }
}
