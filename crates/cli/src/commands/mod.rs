//! Subcommand implementations and the store wiring they share.

pub mod budget;
pub mod jobs;
pub mod memory;
pub mod status;

use planctx_config::AppConfig;
use planctx_core::job::JobStore;
use planctx_core::memory::VectorStore;
use planctx_jobs::{InMemoryJobStore, JobLifecycleManager, SqliteJobStore};
use planctx_memory::{InMemoryVectorStore, NoopVectorStore, SqliteVectorStore, VectorStoreOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}", path.display())
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

/// Open the configured embedding store.
pub async fn open_vector_store(
    config: &AppConfig,
) -> Result<Arc<dyn VectorStore>, Box<dyn std::error::Error>> {
    let options = VectorStoreOptions::from(&config.store);
    debug!(backend = %config.store.backend, dimension = options.dimension, "Opening vector store");
    let store: Arc<dyn VectorStore> = match config.store.backend.as_str() {
        "sqlite" => {
            let path = config.store_path();
            ensure_parent(&path)?;
            Arc::new(SqliteVectorStore::new(&sqlite_url(&path), options).await?)
        }
        "in_memory" => Arc::new(InMemoryVectorStore::new(options)),
        "none" => Arc::new(NoopVectorStore),
        other => return Err(format!("Unknown store backend: {other}").into()),
    };
    Ok(store)
}

/// Open the configured job store behind a lifecycle manager.
pub async fn open_lifecycle(
    config: &AppConfig,
) -> Result<JobLifecycleManager, Box<dyn std::error::Error>> {
    debug!(backend = %config.jobs.backend, "Opening job store");
    let store: Arc<dyn JobStore> = match config.jobs.backend.as_str() {
        "sqlite" => {
            let path = config.jobs_path();
            ensure_parent(&path)?;
            Arc::new(SqliteJobStore::new(&sqlite_url(&path)).await?)
        }
        "in_memory" => Arc::new(InMemoryJobStore::new()),
        other => return Err(format!("Unknown job backend: {other}").into()),
    };
    Ok(JobLifecycleManager::new(store, &config.jobs))
}
