//! SQLite vector store with an in-process HNSW index per plan.
//!
//! Records live in a single `embeddings` table. A partial unique index on
//! `(plan_id, ref_type, ref_id)` over active rows enforces the one-active-
//! record-per-reference invariant at the database level, and upserts go
//! through `INSERT .. ON CONFLICT .. DO UPDATE` against that index, so two
//! writers racing on the same reference resolve to a single row.
//!
//! The HNSW graph for a plan is built lazily from the table on first query
//! and kept in step with writes made through this handle.

use crate::VectorStoreOptions;
use crate::hnsw::HnswIndex;
use crate::vector::{self, check_dimension, cosine_similarity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use planctx_core::error::StoreError;
use planctx_core::memory::{
    EmbeddingRecord, NearestQuery, ScoredRecord, SoftDelete, UpsertRequest, VectorStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A SQLite-backed vector store.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    options: VectorStoreOptions,
    indexes: RwLock<HashMap<String, HnswIndex>>,
}

impl SqliteVectorStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database.
    pub async fn new(path: &str, options: VectorStoreOptions) -> Result<Self, StoreError> {
        let connect = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Every connection to an in-memory database sees its own empty copy.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool, options).await?;
        info!("SQLite vector store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool, options: VectorStoreOptions) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            options,
            indexes: RwLock::new(HashMap::new()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                id          TEXT PRIMARY KEY NOT NULL,
                plan_id     TEXT NOT NULL,
                ref_type    TEXT NOT NULL,
                ref_id      TEXT,
                content     TEXT NOT NULL,
                vector      BLOB NOT NULL,
                is_deleted  INTEGER NOT NULL DEFAULT 0,
                deleted_at  TEXT,
                deleted_by  TEXT,
                version     INTEGER NOT NULL DEFAULT 1,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("embeddings table: {e}")))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_embeddings_active_ref
            ON embeddings(plan_id, ref_type, ref_id)
            WHERE is_deleted = 0 AND ref_id IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("active reference index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_embeddings_plan ON embeddings(plan_id, is_deleted)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("plan index: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<EmbeddingRecord, StoreError> {
        let column = |name: &str, e: sqlx::Error| StoreError::QueryFailed(format!("{name} column: {e}"));

        let id: String = row.try_get("id").map_err(|e| column("id", e))?;
        let plan_id: String = row.try_get("plan_id").map_err(|e| column("plan_id", e))?;
        let ref_type: String = row.try_get("ref_type").map_err(|e| column("ref_type", e))?;
        let ref_id: Option<String> = row.try_get("ref_id").map_err(|e| column("ref_id", e))?;
        let content: String = row.try_get("content").map_err(|e| column("content", e))?;
        let blob: Vec<u8> = row.try_get("vector").map_err(|e| column("vector", e))?;
        let is_deleted: bool = row.try_get("is_deleted").map_err(|e| column("is_deleted", e))?;
        let deleted_at: Option<String> =
            row.try_get("deleted_at").map_err(|e| column("deleted_at", e))?;
        let deleted_by: Option<String> =
            row.try_get("deleted_by").map_err(|e| column("deleted_by", e))?;
        let version: i64 = row.try_get("version").map_err(|e| column("version", e))?;
        let created_at: String = row.try_get("created_at").map_err(|e| column("created_at", e))?;
        let updated_at: String = row.try_get("updated_at").map_err(|e| column("updated_at", e))?;

        Ok(EmbeddingRecord {
            id,
            plan_id,
            ref_type,
            ref_id,
            content,
            vector: Self::blob_to_embedding(&blob),
            deletion: SoftDelete {
                is_deleted,
                deleted_at: deleted_at.as_deref().map(parse_timestamp),
                deleted_by,
            },
            version: version as u64,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    /// Serialize an embedding vector to bytes.
    fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    async fn fetch(&self, id: &str) -> Result<Option<EmbeddingRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM embeddings WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET by ID: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_record(r)?)),
            None => Ok(None),
        }
    }

    /// Single-statement upsert against the active-reference index.
    async fn try_upsert(&self, request: &UpsertRequest, blob: &[u8]) -> Result<String, sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            r#"
            INSERT INTO embeddings (id, plan_id, ref_type, ref_id, content, vector, is_deleted, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 1, ?7, ?7)
            ON CONFLICT(plan_id, ref_type, ref_id) WHERE is_deleted = 0 AND ref_id IS NOT NULL
            DO UPDATE SET
                content = excluded.content,
                vector = excluded.vector,
                version = embeddings.version + 1,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&request.plan_id)
        .bind(&request.ref_type)
        .bind(&request.ref_id)
        .bind(&request.content)
        .bind(blob)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        row.try_get("id")
    }

    /// Id of the active record holding the reference of `record`, if any.
    async fn active_holder(&self, record: &EmbeddingRecord) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT id FROM embeddings WHERE plan_id = ?1 AND ref_type = ?2 AND ref_id = ?3 AND is_deleted = 0",
        )
        .bind(&record.plan_id)
        .bind(&record.ref_type)
        .bind(&record.ref_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("active holder: {e}")))?;

        row.map(|r| r.try_get::<String, _>("id"))
            .transpose()
            .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))
    }

    /// Build the graph of `plan_id` from the table unless already loaded.
    async fn ensure_index(&self, plan_id: &str) -> Result<(), StoreError> {
        if self.indexes.read().await.contains_key(plan_id) {
            return Ok(());
        }

        let mut indexes = self.indexes.write().await;
        if indexes.contains_key(plan_id) {
            return Ok(());
        }

        let rows = sqlx::query(
            "SELECT id, vector FROM embeddings WHERE plan_id = ?1 AND is_deleted = 0 ORDER BY created_at, id",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("index load: {e}")))?;

        let mut index = HnswIndex::new(self.options.dimension, self.options.hnsw);
        for row in &rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?;
            let blob: Vec<u8> = row
                .try_get("vector")
                .map_err(|e| StoreError::QueryFailed(format!("vector column: {e}")))?;
            if let Err(e) = index.insert(&id, &Self::blob_to_embedding(&blob)) {
                warn!(id = %id, "Skipping embedding while building index: {e}");
            }
        }

        info!(plan_id = %plan_id, entries = index.len(), "Loaded HNSW index");
        indexes.insert(plan_id.to_string(), index);
        Ok(())
    }

    async fn index_insert(&self, plan_id: &str, id: &str, vector: &[f32]) -> Result<(), StoreError> {
        if let Some(index) = self.indexes.write().await.get_mut(plan_id) {
            index.insert(id, vector)?;
        }
        Ok(())
    }

    async fn index_remove(&self, plan_id: &str, id: &str) {
        if let Some(index) = self.indexes.write().await.get_mut(plan_id) {
            index.remove(id);
        }
    }
}

/// Lost races surface as unique violations or lock contention.
fn is_retryable(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || db.message().contains("locked") || db.message().contains("busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, request: UpsertRequest) -> Result<String, StoreError> {
        check_dimension(self.options.dimension, &request.vector)?;
        let blob = Self::embedding_to_blob(&request.vector);

        for attempt in 0..=self.options.conflict_retries {
            match self.try_upsert(&request, &blob).await {
                Ok(id) => {
                    self.index_insert(&request.plan_id, &id, &request.vector).await?;
                    debug!(id = %id, plan_id = %request.plan_id, "Upserted embedding");
                    return Ok(id);
                }
                Err(e) if is_retryable(&e) => {
                    debug!(attempt, plan_id = %request.plan_id, "Upsert lost a race: {e}");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(StoreError::Storage(format!("UPSERT failed: {e}"))),
            }
        }

        Err(StoreError::Conflict {
            plan_id: request.plan_id,
            ref_type: request.ref_type,
            ref_id: request.ref_id.unwrap_or_default(),
            attempts: self.options.conflict_retries + 1,
        })
    }

    async fn soft_delete(&self, id: &str, deleted_by: &str) -> Result<EmbeddingRecord, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE embeddings
            SET is_deleted = 1, deleted_at = ?2, deleted_by = ?3, version = version + 1
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .bind(deleted_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("SOFT DELETE failed: {e}")))?;

        let record = match row {
            Some(ref r) => Self::row_to_record(r)?,
            None => return Err(StoreError::NotFound(id.to_string())),
        };
        self.index_remove(&record.plan_id, id).await;
        Ok(record)
    }

    async fn restore(&self, id: &str) -> Result<EmbeddingRecord, StoreError> {
        let mut last_seen = None;
        for attempt in 0..=self.options.conflict_retries {
            let record = self
                .fetch(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if record.is_active() {
                return Ok(record);
            }

            let result = sqlx::query(
                r#"
                UPDATE embeddings
                SET is_deleted = 0, deleted_at = NULL, deleted_by = NULL, version = version + 1
                WHERE id = ?1 AND version = ?2
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(record.version as i64)
            .fetch_optional(&self.pool)
            .await;

            match result {
                Ok(Some(row)) => {
                    let restored = Self::row_to_record(&row)?;
                    self.index_insert(&restored.plan_id, id, &restored.vector).await?;
                    return Ok(restored);
                }
                Ok(None) => {
                    debug!(attempt, id = %id, "Restore raced another write, re-reading");
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    let active_id = self.active_holder(&record).await?.unwrap_or_default();
                    return Err(StoreError::DuplicateReference {
                        plan_id: record.plan_id,
                        ref_type: record.ref_type,
                        ref_id: record.ref_id.unwrap_or_default(),
                        active_id,
                    });
                }
                Err(e) => return Err(StoreError::Storage(format!("RESTORE failed: {e}"))),
            }
            last_seen = Some(record);
        }

        let record = last_seen.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Err(StoreError::Conflict {
            plan_id: record.plan_id,
            ref_type: record.ref_type,
            ref_id: record.ref_id.unwrap_or_default(),
            attempts: self.options.conflict_retries + 1,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<EmbeddingRecord>, StoreError> {
        self.fetch(id).await
    }

    async fn query_nearest(&self, query: NearestQuery) -> Result<Vec<ScoredRecord>, StoreError> {
        check_dimension(self.options.dimension, &query.vector)?;
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        self.ensure_index(&query.plan_id).await?;
        let candidates: Vec<String> = self
            .indexes
            .read()
            .await
            .get(&query.plan_id)
            .map(|index| {
                index
                    .search(&query.vector, query.top_k, self.options.hnsw.ef_search)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect()
            })
            .unwrap_or_default();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder =
            sqlx::QueryBuilder::new("SELECT * FROM embeddings WHERE is_deleted = 0 AND plan_id = ");
        builder.push_bind(&query.plan_id);
        builder.push(" AND id IN (");
        let mut ids = builder.separated(", ");
        for id in &candidates {
            ids.push_bind(id);
        }
        ids.push_unseparated(")");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("candidate fetch: {e}")))?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = Self::row_to_record(row)?;
            scored.push(ScoredRecord {
                similarity: cosine_similarity(&record.vector, &query.vector),
                record,
            });
        }

        Ok(vector::rank(scored, query.threshold, query.top_k))
    }

    async fn count_active(&self, plan_id: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt FROM embeddings WHERE plan_id = ?1 AND is_deleted = 0",
        )
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("COUNT: {e}")))?;

        let cnt: i64 = row
            .try_get("cnt")
            .map_err(|e| StoreError::QueryFailed(format!("cnt column: {e}")))?;

        Ok(cnt as usize)
    }
}
